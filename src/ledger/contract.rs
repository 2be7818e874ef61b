//! Contract call encoding and submission for the command worker.
//!
//! Transactions are submitted with `eth_sendTransaction`; the node holds the key of the
//! configured sender account and signs on our behalf. The sender address is the only
//! signing credential reference the bridge carries.

use super::client::{EthereumClient, receipt_succeeded};
use super::types::*;
use super::LedgerClient;
use crate::abi::function_selector;
use crate::utils::RetryPolicy;

use async_trait::async_trait;
use backoff::future::retry;
use primitive_types::{H160, U256};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const APPROVE_PROPOSAL: &str = "approveProposal(uint256)";
const DEPOSIT_ETHER: &str = "depositEther()";

/// Settings for contract submissions.
#[derive(Debug, Clone)]
pub struct ContractClientConfig {
	/// Contract that receives approve/deposit calls.
	pub contract: H160,
	/// Node-managed account that signs submissions.
	pub sender: H160,
	/// Expected chain id; checked once when connecting.
	pub chain_id: u64,
	/// How long to wait for a receipt; `None` returns as soon as the node accepts the transaction.
	pub receipt_timeout: Option<Duration>,
}

/// [`LedgerClient`] backed by JSON-RPC transaction submission.
#[derive(Clone)]
pub struct ContractClient {
	client: EthereumClient,
	config: ContractClientConfig,
}

impl ContractClient {
	/// Create a client after checking the node serves the configured chain.
	pub async fn connect(client: EthereumClient, config: ContractClientConfig) -> Result<Self, LedgerError> {
		let chain_id = client.chain_id().await?;
		if chain_id != config.chain_id {
			return Err(LedgerError::CredentialError(format!(
				"node at {} reports chain id {}, expected {}",
				client.rpc_url(),
				chain_id,
				config.chain_id
			)));
		}

		info!(
			"Contract client ready for {:#x} on chain {} as {:#x}",
			config.contract, chain_id, config.sender
		);
		Ok(Self { client, config })
	}

	async fn submit(&self, call_data: Vec<u8>, value: U256) -> Result<TxHash, LedgerError> {
		let transaction = json!({
			"from": format!("{:#x}", self.config.sender),
			"to": format!("{:#x}", self.config.contract),
			"data": format!("0x{}", hex::encode(&call_data)),
			"value": format!("0x{:x}", value),
		});

		let hash = self.client.send_transaction(transaction).await?;
		debug!("Transaction {:#x} accepted by node", hash);

		if let Some(timeout) = self.config.receipt_timeout {
			self.wait_for_receipt(&hash, timeout).await?;
		}
		Ok(hash)
	}

	async fn wait_for_receipt(&self, hash: &TxHash, timeout: Duration) -> Result<(), LedgerError> {
		let policy = RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(2), Some(timeout)).backoff();

		let receipt = retry(policy, || async {
			match self.client.transaction_receipt(hash).await {
				Ok(Some(receipt)) => Ok(receipt),
				Ok(None) => Err(backoff::Error::transient(LedgerError::SubmissionError(format!(
					"transaction {:#x} not mined within {:?}",
					hash, timeout
				)))),
				Err(e) => {
					warn!("Receipt lookup for {:#x} failed: {}", hash, e);
					Err(backoff::Error::transient(e))
				}
			}
		})
		.await?;

		match receipt_succeeded(&receipt) {
			Some(false) => Err(LedgerError::SubmissionError(format!(
				"transaction {:#x} reverted",
				hash
			))),
			_ => Ok(()),
		}
	}
}

#[async_trait]
impl LedgerClient for ContractClient {
	async fn approve_proposal(&self, proposal_id: U256) -> Result<TxHash, LedgerError> {
		let hash = self.submit(encode_call(APPROVE_PROPOSAL, &[proposal_id]), U256::zero()).await?;
		info!("Proposal {} approved with tx: {:#x}", proposal_id, hash);
		Ok(hash)
	}

	async fn deposit_ether(&self, amount_wei: U256) -> Result<TxHash, LedgerError> {
		let hash = self.submit(encode_call(DEPOSIT_ETHER, &[]), amount_wei).await?;
		info!("Ether deposited ({} wei) with tx: {:#x}", amount_wei, hash);
		Ok(hash)
	}
}

/// Selector followed by 32-byte big-endian words.
fn encode_call(signature: &str, args: &[U256]) -> Vec<u8> {
	let mut data = Vec::with_capacity(4 + args.len() * 32);
	data.extend_from_slice(&function_selector(signature));
	for arg in args {
		let mut word = [0u8; 32];
		arg.to_big_endian(&mut word);
		data.extend_from_slice(&word);
	}
	data
}
