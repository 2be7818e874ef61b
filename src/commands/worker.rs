//! Command worker.
//!
//! Consumes every command queue, validates each command against its declared kind,
//! submits it through the [`LedgerClient`] and publishes exactly one reply to the
//! command's reply queue. Any number of workers can share the queues; each command
//! is delivered to one of them.

use super::{Command, CommandError, CommandKind, Outcome, Reply};
use crate::broker::{Broker, BrokerError, BrokerHandle, ConsumeOptions, Delivery, Envelope, QueueSpec};
use crate::ledger::LedgerClient;
use crate::utils::{RetryPolicy, parse_ether};

use backoff::backoff::Backoff;
use backoff::future::retry;
use primitive_types::U256;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A command that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
	Approve { proposal_id: U256 },
	Deposit { amount: String, amount_wei: U256 },
}

/// Check a payload against the shape its kind requires.
pub fn validate(kind: CommandKind, payload: &Map<String, Value>) -> Result<LedgerCall, CommandError> {
	match kind {
		CommandKind::Approve => {
			let proposal_id = match payload.get("proposalId") {
				Some(Value::Number(n)) => n
					.as_u64()
					.map(U256::from)
					.ok_or_else(|| CommandError::Validation("proposalId must be a positive integer".into()))?,
				Some(Value::String(s)) => U256::from_dec_str(s.trim())
					.map_err(|_| CommandError::Validation(format!("proposalId {:?} is not an integer", s)))?,
				Some(_) => return Err(CommandError::Validation("proposalId must be a positive integer".into())),
				None => return Err(CommandError::Validation("proposalId is required".into())),
			};
			if proposal_id.is_zero() {
				return Err(CommandError::Validation("proposalId must be positive".into()));
			}
			Ok(LedgerCall::Approve { proposal_id })
		}
		CommandKind::Deposit => {
			let amount = match payload.get("amount") {
				Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
				Some(Value::Number(n)) => n.to_string(),
				Some(_) => return Err(CommandError::Validation("amount must be a decimal string".into())),
				None => return Err(CommandError::Validation("amount is required".into())),
			};
			let amount_wei = parse_ether(&amount).map_err(|e| CommandError::Validation(e.to_string()))?;
			if amount_wei.is_zero() {
				return Err(CommandError::Validation("amount must be positive".into()));
			}
			Ok(LedgerCall::Deposit { amount, amount_wei })
		}
	}
}

/// Where a reply goes and what it answers.
struct ReplyTarget {
	reply_to: String,
	correlation_id: String,
}

/// Consumes commands and submits them to the ledger.
pub struct CommandWorker {
	broker: Arc<BrokerHandle>,
	ledger: Arc<dyn LedgerClient>,
	concurrency: usize,
	retry: RetryPolicy,
}

impl CommandWorker {
	pub fn new(broker: Arc<BrokerHandle>, ledger: Arc<dyn LedgerClient>) -> Self {
		Self {
			broker,
			ledger,
			concurrency: 1,
			retry: RetryPolicy::default_network(),
		}
	}

	/// Number of competing consumers per command queue.
	pub fn with_concurrency(mut self, concurrency: usize) -> Self {
		self.concurrency = concurrency.max(1);
		self
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Run the consumers until `cancel` fires. A command being processed when
	/// cancellation arrives is finished and replied to first.
	pub async fn run(self, cancel: CancellationToken) {
		let worker = Arc::new(self);
		let mut consumers = JoinSet::new();
		for kind in CommandKind::ALL {
			for slot in 0..worker.concurrency {
				let worker = worker.clone();
				let cancel = cancel.clone();
				consumers.spawn(async move { worker.consume(kind, slot, cancel).await });
			}
		}
		while let Some(result) = consumers.join_next().await {
			if let Err(e) = result {
				error!("Command consumer task failed: {}", e);
			}
		}
		info!("Command worker stopped");
	}

	async fn consume(&self, kind: CommandKind, slot: usize, cancel: CancellationToken) {
		let queue = kind.queue();
		let policy = RetryPolicy::unbounded();
		let mut backoff = policy.backoff();

		while !cancel.is_cancelled() {
			let opened = async {
				let broker = self.broker.get().await?;
				broker.declare_queue(&QueueSpec::durable(queue)).await?;
				let consumer = broker.consume(queue, ConsumeOptions::auto_ack()).await?;
				Ok::<_, BrokerError>((broker, consumer))
			};
			let (broker, mut consumer) = match opened.await {
				Ok(opened) => {
					info!(queue, "Command consumer {} ready", slot);
					backoff.reset();
					opened
				}
				Err(e) => {
					let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
					warn!(queue, "Command consumer {} unavailable, retrying in {:?}: {}", slot, delay, e);
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(delay) => continue,
					}
				}
			};

			loop {
				let delivery = tokio::select! {
					_ = cancel.cancelled() => {
						if let Err(e) = consumer.cancel().await {
							warn!(queue, "Failed to cancel command consumer: {}", e);
						}
						return;
					}
					delivery = consumer.next() => delivery,
				};
				match delivery {
					Some(Ok(delivery)) => self.handle(broker.as_ref(), kind, delivery).await,
					Some(Err(e)) => {
						warn!(queue, "Command consumer error: {}", e);
						break;
					}
					None => {
						warn!(queue, "Command consumer closed");
						break;
					}
				}
			}
		}
	}

	/// Process one delivery and publish its reply. Never fails; problems are logged.
	async fn handle(&self, broker: &dyn Broker, kind: CommandKind, delivery: Delivery) {
		let (target, outcome) = self.process(kind, &delivery.envelope).await;

		let Some(target) = target else {
			error!(queue = kind.queue(), "Dropping {} command without a reply queue", kind);
			return;
		};

		if let Err(e) = self.reply(broker, &target, outcome).await {
			error!(
				correlation_id = %target.correlation_id,
				"Failed to publish reply to {}: {}",
				target.reply_to, e
			);
		}
	}

	async fn process(&self, kind: CommandKind, envelope: &Envelope) -> (Option<ReplyTarget>, Outcome) {
		let command = serde_json::from_slice::<Command>(&envelope.body);

		// Routing comes from the command itself; the message properties are only a
		// fallback for bodies that cannot be parsed.
		let target = match &command {
			Ok(command) => Some(ReplyTarget {
				reply_to: command.reply_to.clone(),
				correlation_id: command.correlation_id.clone(),
			}),
			Err(_) => envelope.reply_to.clone().map(|reply_to| ReplyTarget {
				reply_to,
				correlation_id: envelope.correlation_id.clone().unwrap_or_default(),
			}),
		};
		let correlation_id = target.as_ref().map(|t| t.correlation_id.as_str()).unwrap_or("");

		let result = match command {
			Ok(command) if command.kind != kind => Err(CommandError::Validation(format!(
				"{} command received on {} queue",
				command.kind,
				kind.queue()
			))),
			Ok(command) => match validate(kind, &command.payload) {
				Ok(call) => self.submit(call, correlation_id).await,
				Err(e) => Err(e),
			},
			Err(e) => Err(CommandError::Validation(format!("malformed command: {}", e))),
		};

		let outcome = match result {
			Ok(transaction_hash) => Outcome::Success {
				message: "Success".to_string(),
				transaction_hash: Some(transaction_hash),
			},
			Err(e) => {
				warn!(correlation_id = %correlation_id, "{} command failed: {}", kind, e);
				Outcome::Failure {
					error: e.to_string(),
					details: None,
				}
			}
		};
		(target, outcome)
	}

	async fn submit(&self, call: LedgerCall, correlation_id: &str) -> Result<String, CommandError> {
		let hash = match &call {
			LedgerCall::Approve { proposal_id } => {
				info!(correlation_id = %correlation_id, "Approving proposal {}", proposal_id);
				self.ledger.approve_proposal(*proposal_id).await?
			}
			LedgerCall::Deposit { amount, amount_wei } => {
				info!(correlation_id = %correlation_id, "Depositing {} ether ({} wei)", amount, amount_wei);
				self.ledger.deposit_ether(*amount_wei).await?
			}
		};
		Ok(format!("{:#x}", hash))
	}

	async fn reply(&self, broker: &dyn Broker, target: &ReplyTarget, outcome: Outcome) -> Result<(), BrokerError> {
		let reply = Reply::new(target.correlation_id.as_str(), outcome);
		let body = serde_json::to_vec(&reply).map_err(|e| BrokerError::PublishError(e.to_string()))?;

		retry(self.retry.backoff(), || async {
			broker
				.publish(
					&target.reply_to,
					Envelope::json(body.clone()).with_correlation_id(target.correlation_id.as_str()),
				)
				.await
				.map_err(|e| match e {
					// The caller's reply queue is gone; retrying cannot help.
					BrokerError::QueueNotFound(_) => backoff::Error::permanent(e),
					other => backoff::Error::transient(other),
				})
		})
		.await?;

		info!(correlation_id = %target.correlation_id, "Reply sent to {}", target.reply_to);
		Ok(())
	}
}
