use primitive_types::H256;
use sha3::{Digest, Keccak256};

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: impl AsRef<[u8]>) -> H256 {
	H256::from_slice(&Keccak256::digest(data.as_ref()))
}

/// Topic 0 of a non-anonymous event, e.g. `DepositedEther(address,uint256)`.
pub fn event_topic(signature: &str) -> H256 {
	keccak256(signature.as_bytes())
}

/// First four bytes of the hash of a function signature.
pub fn function_selector(signature: &str) -> [u8; 4] {
	let hash = keccak256(signature.as_bytes());
	let mut selector = [0u8; 4];
	selector.copy_from_slice(&hash.as_bytes()[..4]);
	selector
}
