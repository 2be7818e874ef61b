//! Ledger integration module
//!
//! This module provides the seams through which the bridge talks to the ledger: a
//! [`LogSource`] for reading logs (range queries and push subscriptions) and a
//! [`LedgerClient`] for submitting operations. The JSON-RPC implementations live in
//! `client` and `contract`; tests substitute scripted implementations.

/// JSON-RPC HTTP/WebSocket client
mod client;
/// Contract call encoding and submission
mod contract;
/// Log and error types
mod types;

pub use client::EthereumClient;
pub use contract::{ContractClient, ContractClientConfig};
pub use types::*;

use async_trait::async_trait;
use primitive_types::U256;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Read access to ledger logs.
#[async_trait]
pub trait LogSource: Send + Sync {
	/// Current chain tip.
	async fn block_number(&self) -> Result<u64, LedgerError>;

	/// Logs matching `filter` over its inclusive block range, in chain order.
	async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LedgerError>;

	/// Push subscription to new logs matching `filter`, starting from now.
	async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription, LedgerError>;
}

/// Operations the command worker submits to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
	/// Approve a pending proposal.
	async fn approve_proposal(&self, proposal_id: U256) -> Result<TxHash, LedgerError>;

	/// Deposit `amount_wei` into the contract.
	async fn deposit_ether(&self, amount_wei: U256) -> Result<TxHash, LedgerError>;
}

/// A live push subscription.
///
/// Items arrive in chain order; an `Err` item means the transport failed and the
/// subscription will yield nothing further.
pub struct LogSubscription {
	id: String,
	receiver: mpsc::Receiver<Result<Log, LedgerError>>,
	shutdown: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl LogSubscription {
	pub fn new(id: String, receiver: mpsc::Receiver<Result<Log, LedgerError>>) -> Self {
		Self {
			id,
			receiver,
			shutdown: None,
			task: None,
		}
	}

	/// Attach the signal that asks the reader to unsubscribe.
	pub fn with_shutdown(mut self, shutdown: oneshot::Sender<()>) -> Self {
		self.shutdown = Some(shutdown);
		self
	}

	/// Attach the reader task so `unsubscribe` can wait for it.
	pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
		self.task = Some(task);
		self
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	/// Next pushed log, or `None` once the reader is gone.
	pub async fn next(&mut self) -> Option<Result<Log, LedgerError>> {
		self.receiver.recv().await
	}

	/// Cancel the subscription at the node and wait for the reader to finish.
	pub async fn unsubscribe(mut self) {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}
		self.receiver.close();
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}
