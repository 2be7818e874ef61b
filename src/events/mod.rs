//! Ledger event ingestion module
//!
//! Two paths observe ledger logs: per-feed pollers that query block ranges behind a
//! cursor, and a subscriber that receives logs pushed by the node. Both decode logs
//! against the ABI registry and hand the resulting [`LedgerEvent`]s to an
//! [`EventSink`], normally the [`EventPublisher`], which puts them on the durable event
//! queue. The same event can arrive through both paths; consumers must tolerate
//! duplicates.

/// Downstream event queue consumer and in-memory event log
mod consumer;
/// Per-feed cursor tracking and persistence
mod cursor;
/// Range-based polling ingestion
mod poller;
/// Broker publication of decoded events
mod publisher;
/// Push subscription ingestion
mod subscriber;
/// Event types and errors
mod types;

pub use consumer::{EventConsumer, EventLog};
pub use cursor::{BlockRange, CursorStore, CursorTracker, FileCursorStore, MemoryCursorStore};
pub use poller::{EventPoller, Feed, PollOutcome};
pub use publisher::EventPublisher;
pub use subscriber::{EventSubscriber, SubscriptionState};
pub use types::*;

use async_trait::async_trait;

/// Destination for decoded events.
#[async_trait]
pub trait EventSink: Send + Sync {
	async fn publish(&self, event: LedgerEvent) -> Result<(), IngestError>;
}
