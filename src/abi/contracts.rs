//! ABIs of the contracts the bridge talks to, bundled at compile time.

use crate::abi::types::{Abi, AbiError};

pub const INITIALIZER_ABI: &str = include_str!("contracts/initializer.json");
pub const APPROVAL_ABI: &str = include_str!("contracts/approval.json");
pub const PROPOSAL_ABI: &str = include_str!("contracts/proposal.json");

/// `(feed name, ABI)` pairs in merge order.
pub fn bundled_abis() -> Result<Vec<(&'static str, Abi)>, AbiError> {
	Ok(vec![
		("Initializer", Abi::from_json(INITIALIZER_ABI)?),
		("Approval", Abi::from_json(APPROVAL_ABI)?),
		("Proposal", Abi::from_json(PROPOSAL_ABI)?),
	])
}
