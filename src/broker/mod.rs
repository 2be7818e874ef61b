//! Message broker module
//!
//! Queues carry commands from the gateway to the worker, replies back to the caller's
//! private reply queue, and decoded ledger events to their consumers. The [`Broker`]
//! trait is the seam: [`AmqpBroker`] talks to a real AMQP 0-9-1 server and
//! [`InMemoryBroker`] gives the same queue semantics inside one process.

/// AMQP 0-9-1 adapter
mod amqp;
/// Lazily connected, shared broker handle
mod handle;
/// In-process broker
mod memory;
/// Queue, message and error types
mod types;

pub use amqp::{AmqpBroker, AmqpConnector};
pub use handle::{BrokerHandle, Connector};
pub use memory::InMemoryBroker;
pub use types::*;

use async_trait::async_trait;

/// Durable queue for approval commands.
pub const APPROVAL_QUEUE: &str = "approval_queue";
/// Durable queue for deposit commands.
pub const DEPOSIT_QUEUE: &str = "deposit_queue";
/// Durable queue for decoded ledger events.
pub const EVENTS_QUEUE: &str = "events_queue";

/// A connection to a message broker.
///
/// Implementations must be safe to share between tasks; publishing from several
/// tasks at once is allowed.
#[async_trait]
pub trait Broker: Send + Sync {
	/// Declare a queue, returning its (possibly generated) name.
	async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

	/// Publish `envelope` to the named queue.
	async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError>;

	/// Start consuming the named queue.
	async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Box<dyn Consumer>, BrokerError>;

	/// Whether the connection is still usable.
	fn is_open(&self) -> bool;

	/// Close the connection. Active consumers stop receiving.
	async fn close(&self) -> Result<(), BrokerError>;
}

/// An active consumer on one queue.
#[async_trait]
pub trait Consumer: Send {
	/// Next delivery, or `None` once the consumer or connection is closed.
	async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

	/// Stop consuming. Unacknowledged deliveries return to the queue.
	async fn cancel(self: Box<Self>) -> Result<(), BrokerError>;
}
