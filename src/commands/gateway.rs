//! Request/reply over the broker.
//!
//! Every call gets its own broker-named reply queue, which is exclusive and
//! auto-deleted. The gateway starts consuming that queue before it publishes the
//! command; a reply published before the consumer attaches could otherwise be lost.

use super::{Command, CommandError, CommandKind, Outcome, Reply};
use crate::broker::{Broker, BrokerError, BrokerHandle, ConsumeOptions, Consumer, Envelope, QueueSpec};

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Issues commands and waits for their replies.
#[derive(Clone)]
pub struct CommandGateway {
	broker: Arc<BrokerHandle>,
	timeout: Duration,
	shutdown: CancellationToken,
}

impl CommandGateway {
	pub fn new(broker: Arc<BrokerHandle>) -> Self {
		Self {
			broker,
			timeout: DEFAULT_REPLY_TIMEOUT,
			shutdown: CancellationToken::new(),
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Refuse new calls once `shutdown` is cancelled. Calls already waiting are unaffected.
	pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
		self.shutdown = shutdown;
		self
	}

	/// Issue a command with the configured reply timeout.
	pub async fn call(&self, kind: CommandKind, payload: Map<String, Value>) -> Result<Outcome, CommandError> {
		self.issue(kind, payload, self.timeout).await
	}

	/// Publish a command and wait for its reply.
	///
	/// # Arguments
	///
	/// * `kind` - Command kind; selects the destination queue
	/// * `payload` - Kind-specific fields, validated by the worker
	/// * `timeout` - How long to wait for the reply
	///
	/// # Returns
	///
	/// The worker's outcome, or [`CommandError::Timeout`] when no reply arrived in time.
	/// A timeout says nothing about whether the worker ran the command.
	pub async fn issue(
		&self,
		kind: CommandKind,
		payload: Map<String, Value>,
		timeout: Duration,
	) -> Result<Outcome, CommandError> {
		if self.shutdown.is_cancelled() {
			return Err(CommandError::ShuttingDown);
		}

		let broker = self.broker.get().await?;

		let reply_queue = broker.declare_queue(&QueueSpec::private_reply()).await?;
		let mut replies = broker
			.consume(
				&reply_queue,
				ConsumeOptions {
					auto_ack: true,
					exclusive: true,
				},
			)
			.await?;

		let correlation_id = Uuid::new_v4().to_string();
		let result = async {
			self.publish(broker.as_ref(), kind, payload, &correlation_id, &reply_queue)
				.await?;
			match tokio::time::timeout(timeout, wait_for_reply(replies.as_mut(), &correlation_id)).await {
				Ok(outcome) => outcome,
				Err(_) => {
					warn!(
						correlation_id = %correlation_id,
						"No reply to {} command within {:?}", kind, timeout
					);
					Err(CommandError::Timeout {
						correlation_id: correlation_id.clone(),
						timeout,
					})
				}
			}
		}
		.await;

		if let Err(e) = replies.cancel().await {
			debug!(correlation_id = %correlation_id, "Failed to cancel reply consumer: {}", e);
		}
		result
	}

	async fn publish(
		&self,
		broker: &dyn Broker,
		kind: CommandKind,
		payload: Map<String, Value>,
		correlation_id: &str,
		reply_queue: &str,
	) -> Result<(), CommandError> {
		let command = Command {
			kind,
			payload,
			correlation_id: correlation_id.to_string(),
			reply_to: reply_queue.to_string(),
		};
		let body = serde_json::to_vec(&command)?;

		broker.declare_queue(&QueueSpec::durable(kind.queue())).await?;
		broker
			.publish(
				kind.queue(),
				Envelope::json(body)
					.with_correlation_id(correlation_id)
					.with_reply_to(reply_queue),
			)
			.await?;

		info!(correlation_id = %correlation_id, queue = kind.queue(), "Issued {} command", kind);
		Ok(())
	}
}

/// First reply on `replies` whose correlation id matches. Others are logged and dropped.
async fn wait_for_reply(replies: &mut dyn Consumer, correlation_id: &str) -> Result<Outcome, CommandError> {
	loop {
		let delivery = match replies.next().await {
			Some(Ok(delivery)) => delivery,
			Some(Err(e)) => return Err(e.into()),
			None => return Err(BrokerError::Closed.into()),
		};

		if delivery.envelope.correlation_id.as_deref() != Some(correlation_id) {
			warn!(
				correlation_id = %correlation_id,
				"Ignoring reply with unexpected correlation id {:?}",
				delivery.envelope.correlation_id
			);
			continue;
		}

		let outcome = match serde_json::from_slice::<Reply>(delivery.body()) {
			Ok(reply) => reply.outcome(),
			Err(e) => {
				warn!(correlation_id = %correlation_id, "Failed to parse reply: {}", e);
				Outcome::Failure {
					error: "Failed to parse response".to_string(),
					details: Some(String::from_utf8_lossy(delivery.body()).into_owned()),
				}
			}
		};
		debug!(correlation_id = %correlation_id, "Received reply: {:?}", outcome);
		return Ok(outcome);
	}
}
