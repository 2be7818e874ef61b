//! Push-based log ingestion.
//!
//! Keeps one live log subscription open against the ledger and decodes every pushed
//! log with the merged registry. When the subscription drops, it is re-established
//! after a backoff delay and resumes from "now"; logs emitted while disconnected are
//! only recovered by the poller feeds.

use super::{EventSink, LedgerEvent};
use crate::abi::{DecodeError, EventRegistry};
use crate::ledger::{Log, LogFilter, LogSource, LogSubscription};
use crate::utils::RetryPolicy;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A subscription up this long counts as healthy even if it delivered nothing.
pub const STABLE_AFTER: Duration = Duration::from_secs(30);

/// Lifecycle of the push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Disconnected,
	Connected,
	Reconnecting,
}

/// Live subscriber over every configured contract.
pub struct EventSubscriber {
	source: Arc<dyn LogSource>,
	sink: Arc<dyn EventSink>,
	registry: Arc<EventRegistry>,
	filter: LogFilter,
	retry: RetryPolicy,
	state: watch::Sender<SubscriptionState>,
}

impl EventSubscriber {
	pub fn new(
		source: Arc<dyn LogSource>,
		sink: Arc<dyn EventSink>,
		registry: Arc<EventRegistry>,
		filter: LogFilter,
	) -> Self {
		let (state, _) = watch::channel(SubscriptionState::Disconnected);
		Self {
			source,
			sink,
			registry,
			filter,
			retry: RetryPolicy::unbounded(),
			state,
		}
	}

	/// Override the delay between resubscription attempts.
	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Watch the subscription state.
	pub fn state(&self) -> watch::Receiver<SubscriptionState> {
		self.state.subscribe()
	}

	fn set_state(&self, state: SubscriptionState) {
		self.state.send_replace(state);
	}

	/// Subscribe and ingest until cancelled, resubscribing after every drop.
	///
	/// One backoff sequence spans both failed subscribe calls and subscriptions that
	/// drop right away. It starts over only after a subscription delivered a log or
	/// stayed up for [`STABLE_AFTER`]. On cancellation the live subscription is
	/// cancelled at the node before returning.
	pub async fn run(self, cancel: CancellationToken) {
		let mut backoff = self.retry.backoff();
		loop {
			let Some(mut subscription) = self.subscribe(&cancel, &mut backoff).await else {
				break;
			};
			self.set_state(SubscriptionState::Connected);
			info!("Log subscription {} active", subscription.id());

			let opened = Instant::now();
			let mut delivered = false;
			loop {
				tokio::select! {
					_ = cancel.cancelled() => {
						info!("Cancelling log subscription {}", subscription.id());
						subscription.unsubscribe().await;
						self.set_state(SubscriptionState::Disconnected);
						return;
					}
					item = subscription.next() => match item {
						Some(Ok(log)) => {
							delivered = true;
							self.handle_log(log).await;
						}
						Some(Err(e)) => {
							warn!("Log subscription {} dropped: {}", subscription.id(), e);
							break;
						}
						None => {
							warn!("Log subscription {} ended", subscription.id());
							break;
						}
					}
				}
			}

			subscription.unsubscribe().await;
			self.set_state(SubscriptionState::Reconnecting);

			if delivered || opened.elapsed() >= STABLE_AFTER {
				backoff.reset();
			}
			let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
			debug!("Resubscribing in {:?}", delay);
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(delay) => {}
			}
		}

		self.set_state(SubscriptionState::Disconnected);
		info!("Event subscriber stopped");
	}

	/// Open a subscription, retrying with `backoff` until it succeeds or `cancel` fires.
	async fn subscribe(
		&self,
		cancel: &CancellationToken,
		backoff: &mut ExponentialBackoff,
	) -> Option<LogSubscription> {
		loop {
			if cancel.is_cancelled() {
				return None;
			}

			match self.source.subscribe_logs(&self.filter).await {
				Ok(subscription) => return Some(subscription),
				Err(e) => {
					let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
					self.set_state(SubscriptionState::Reconnecting);
					warn!("Log subscription failed, retrying in {:?}: {}", delay, e);
					tokio::select! {
						_ = cancel.cancelled() => return None,
						_ = tokio::time::sleep(delay) => {}
					}
				}
			}
		}
	}

	async fn handle_log(&self, log: Log) {
		if log.removed {
			debug!("Skipping removed log in block {}", log.block_number);
			return;
		}

		let decoded = match self.registry.decode(&log) {
			Ok(decoded) => decoded,
			Err(DecodeError::UnknownSignature(signature)) => {
				warn!(
					"Skipping log with unknown signature {} in block {}",
					signature, log.block_number
				);
				return;
			}
			Err(e) => {
				warn!(
					"Skipping undecodable log {:#x}:{} in block {}: {}",
					log.transaction_hash, log.log_index, log.block_number, e
				);
				return;
			}
		};

		let name = decoded.name.clone();
		if let Err(e) = self.sink.publish(LedgerEvent::from_decoded(decoded, &log)).await {
			error!(
				"Failed to publish {} from block {} (tx {:#x}): {}",
				name, log.block_number, log.transaction_hash, e
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::abi::contracts::bundled_abis;
	use crate::abi::event_topic;
	use crate::events::IngestError;
	use crate::ledger::LedgerError;
	use async_trait::async_trait;
	use primitive_types::{H160, H256};
	use std::collections::VecDeque;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::{mpsc, oneshot};

	type Feed = mpsc::Sender<Result<Log, LedgerError>>;

	/// Hands out pre-built subscriptions in order.
	struct ScriptedStream {
		pending: Mutex<VecDeque<LogSubscription>>,
		attempts: AtomicUsize,
		unsubscribed: Arc<AtomicUsize>,
	}

	impl ScriptedStream {
		fn new(count: usize) -> (Arc<Self>, Vec<Feed>) {
			let unsubscribed = Arc::new(AtomicUsize::new(0));
			let mut pending = VecDeque::new();
			let mut feeds = Vec::new();
			for i in 0..count {
				let (tx, rx) = mpsc::channel(16);
				let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
				let counter = unsubscribed.clone();
				let task = tokio::spawn(async move {
					if shutdown_rx.await.is_ok() {
						counter.fetch_add(1, Ordering::SeqCst);
					}
				});
				pending.push_back(
					LogSubscription::new(format!("0x{}", i), rx)
						.with_shutdown(shutdown_tx)
						.with_task(task),
				);
				feeds.push(tx);
			}
			let stream = Arc::new(Self {
				pending: Mutex::new(pending),
				attempts: AtomicUsize::new(0),
				unsubscribed,
			});
			(stream, feeds)
		}
	}

	#[async_trait]
	impl LogSource for ScriptedStream {
		async fn block_number(&self) -> Result<u64, LedgerError> {
			Ok(0)
		}

		async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<Log>, LedgerError> {
			Ok(Vec::new())
		}

		async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogSubscription, LedgerError> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			self.pending
				.lock()
				.unwrap()
				.pop_front()
				.ok_or_else(|| LedgerError::SubscriptionClosed("no more scripted subscriptions".into()))
		}
	}

	/// Accepts every subscription and drops it before any log arrives.
	#[derive(Default)]
	struct FlappingSource {
		attempts: AtomicUsize,
	}

	#[async_trait]
	impl LogSource for FlappingSource {
		async fn block_number(&self) -> Result<u64, LedgerError> {
			Ok(0)
		}

		async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<Log>, LedgerError> {
			Ok(Vec::new())
		}

		async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogSubscription, LedgerError> {
			let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
			let (tx, rx) = mpsc::channel(1);
			let _ = tx.try_send(Err(LedgerError::SubscriptionClosed("node went away".into())));
			Ok(LogSubscription::new(format!("0x{}", attempt), rx))
		}
	}

	struct ChannelSink(mpsc::UnboundedSender<LedgerEvent>);

	#[async_trait]
	impl EventSink for ChannelSink {
		async fn publish(&self, event: LedgerEvent) -> Result<(), IngestError> {
			let _ = self.0.send(event);
			Ok(())
		}
	}

	fn approved_log(block: u64, proposal_id: u64) -> Log {
		Log {
			address: H160::repeat_byte(0x42),
			topics: vec![
				event_topic("ProposalApproved(uint256)"),
				H256::from_low_u64_be(proposal_id),
			],
			data: Vec::new(),
			block_number: block,
			transaction_hash: H256::repeat_byte(0x01),
			block_hash: H256::repeat_byte(0x02),
			transaction_index: 0,
			log_index: 0,
			removed: false,
		}
	}

	fn subscriber(source: Arc<ScriptedStream>) -> (EventSubscriber, mpsc::UnboundedReceiver<LedgerEvent>) {
		let abis = bundled_abis().unwrap();
		let registry = Arc::new(EventRegistry::merged(abis.iter().map(|(_, abi)| abi)));
		let (tx, rx) = mpsc::unbounded_channel();
		let subscriber = EventSubscriber::new(
			source,
			Arc::new(ChannelSink(tx)),
			registry,
			LogFilter::for_addresses(vec![H160::repeat_byte(0x42)]),
		)
		.with_retry(RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20), None));
		(subscriber, rx)
	}

	async fn recv(rx: &mut mpsc::UnboundedReceiver<LedgerEvent>) -> LedgerEvent {
		tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("event within timeout")
			.expect("sink open")
	}

	#[tokio::test]
	async fn resubscribes_after_drop_and_keeps_ingesting() {
		let (source, feeds) = ScriptedStream::new(2);
		let (subscriber, mut events) = subscriber(source.clone());
		let cancel = CancellationToken::new();
		let task = tokio::spawn(subscriber.run(cancel.clone()));

		feeds[0].send(Ok(approved_log(5, 1))).await.unwrap();
		assert_eq!(recv(&mut events).await.block_number, 5);

		feeds[0]
			.send(Err(LedgerError::SubscriptionClosed("node restarted".into())))
			.await
			.unwrap();
		feeds[1].send(Ok(approved_log(9, 2))).await.unwrap();

		let event = recv(&mut events).await;
		assert_eq!(event.name, "ProposalApproved");
		assert_eq!(event.block_number, 9);
		assert_eq!(source.attempts.load(Ordering::SeqCst), 2);

		cancel.cancel();
		task.await.unwrap();
		assert_eq!(source.unsubscribed.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn unknown_and_removed_logs_are_skipped() {
		let (source, feeds) = ScriptedStream::new(1);
		let (subscriber, mut events) = subscriber(source);
		let cancel = CancellationToken::new();
		let task = tokio::spawn(subscriber.run(cancel.clone()));

		let mut unknown = approved_log(3, 1);
		unknown.topics[0] = event_topic("Unrelated(uint256)");
		let mut removed = approved_log(4, 1);
		removed.removed = true;

		feeds[0].send(Ok(unknown)).await.unwrap();
		feeds[0].send(Ok(removed)).await.unwrap();
		feeds[0].send(Ok(approved_log(6, 3))).await.unwrap();

		let event = recv(&mut events).await;
		assert_eq!(event.block_number, 6);

		cancel.cancel();
		task.await.unwrap();
	}

	#[tokio::test]
	async fn state_follows_subscription_lifecycle() {
		let (source, feeds) = ScriptedStream::new(1);
		let (subscriber, _events) = subscriber(source);
		let mut state = subscriber.state();
		assert_eq!(*state.borrow(), SubscriptionState::Disconnected);

		let cancel = CancellationToken::new();
		let task = tokio::spawn(subscriber.run(cancel.clone()));

		state
			.wait_for(|s| *s == SubscriptionState::Connected)
			.await
			.unwrap();

		// Only one subscription is scripted, so the drop leaves it reconnecting.
		feeds[0]
			.send(Err(LedgerError::SubscriptionClosed("dropped".into())))
			.await
			.unwrap();
		state
			.wait_for(|s| *s == SubscriptionState::Reconnecting)
			.await
			.unwrap();

		cancel.cancel();
		task.await.unwrap();
		assert_eq!(*state.borrow(), SubscriptionState::Disconnected);
	}

	#[tokio::test]
	async fn immediately_dropped_subscriptions_are_backed_off() {
		let source = Arc::new(FlappingSource::default());
		let (tx, _events) = mpsc::unbounded_channel();
		let subscriber = EventSubscriber::new(
			source.clone(),
			Arc::new(ChannelSink(tx)),
			Arc::new(EventRegistry::default()),
			LogFilter::default(),
		)
		.with_retry(RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(100), None));
		let cancel = CancellationToken::new();
		let task = tokio::spawn(subscriber.run(cancel.clone()));

		tokio::time::sleep(Duration::from_millis(300)).await;
		cancel.cancel();
		task.await.unwrap();

		// Randomized delays never drop below half the 100ms interval.
		let attempts = source.attempts.load(Ordering::SeqCst);
		assert!(attempts >= 2, "never resubscribed");
		assert!(attempts <= 8, "{} subscribe attempts in 300ms", attempts);
	}
}
