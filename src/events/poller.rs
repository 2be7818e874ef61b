//! Range-based log ingestion.
//!
//! Each feed polls the chain tip on a fixed interval, queries the logs of its
//! contracts between its cursor and the tip, and hands every log that matches one of
//! its event signatures to the sink. The cursor advances only after the whole range
//! has been queried and published.

use super::cursor::{BlockRange, CursorStore, CursorTracker};
use super::{EventSink, IngestError, LedgerEvent};
use crate::abi::{DecodeError, EventRegistry};
use crate::ledger::{LogFilter, LogSource};
use crate::utils::RetryPolicy;

use backoff::backoff::Backoff;
use primitive_types::H160;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// One contract/ABI pair to ingest.
#[derive(Clone)]
pub struct Feed {
	pub name: String,
	pub addresses: Vec<H160>,
	pub registry: Arc<EventRegistry>,
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
	/// Tip unchanged since the last tick.
	Idle,
	/// Tip not ahead of the cursor.
	UpToDate,
	/// Range queried and published.
	Fetched {
		range: BlockRange,
		published: usize,
		skipped: usize,
	},
}

/// Poller for one feed.
pub struct EventPoller {
	feed: Feed,
	source: Arc<dyn LogSource>,
	sink: Arc<dyn EventSink>,
	store: Arc<dyn CursorStore>,
	tracker: CursorTracker,
	interval: Duration,
	retry: RetryPolicy,
	last_tip: Option<u64>,
}

impl EventPoller {
	/// Create a poller whose cursor starts at `start_block` unless the store has one.
	pub fn new(
		feed: Feed,
		source: Arc<dyn LogSource>,
		sink: Arc<dyn EventSink>,
		store: Arc<dyn CursorStore>,
		start_block: u64,
	) -> Self {
		let tracker = CursorTracker::new(feed.name.clone(), start_block);
		Self {
			feed,
			source,
			sink,
			store,
			tracker,
			interval: Duration::from_secs(1),
			retry: RetryPolicy::default_network(),
			last_tip: None,
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	/// Backoff for loading the stored cursor at startup.
	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn cursor(&self) -> u64 {
		self.tracker.last_block()
	}

	/// Load the stored cursor for this feed, if any.
	pub async fn restore(&mut self) -> Result<(), IngestError> {
		if let Some(last_block) = self.store.load(&self.feed.name).await? {
			self.tracker.advance(last_block);
		}
		info!(
			feed = %self.feed.name,
			"Polling from block {} for {} event(s)",
			self.tracker.last_block() + 1,
			self.feed.registry.len()
		);
		Ok(())
	}

	/// Run one tick: read the tip, fetch the new range and publish its events.
	pub async fn poll_once(&mut self) -> Result<PollOutcome, IngestError> {
		let tip = self.source.block_number().await?;
		if self.last_tip == Some(tip) && self.tracker.last_block() >= tip {
			trace!(feed = %self.feed.name, "Tip {} unchanged", tip);
			return Ok(PollOutcome::Idle);
		}
		self.last_tip = Some(tip);

		let Some(range) = self.tracker.observe(tip) else {
			return Ok(PollOutcome::UpToDate);
		};

		let (published, skipped) = self.ingest_range(range).await.inspect_err(|e| {
			error!(
				feed = %self.feed.name,
				from_block = range.from,
				to_block = range.to,
				"Ingesting range failed, it will be retried: {}",
				e
			);
		})?;

		self.tracker.advance(range.to);
		if let Err(e) = self.store.save(&self.feed.name, range.to).await {
			warn!(feed = %self.feed.name, "Failed to persist cursor {}: {}", range.to, e);
		}

		if published > 0 {
			info!(
				feed = %self.feed.name,
				"Published {} event(s) from blocks {}..={}",
				published, range.from, range.to
			);
		}
		Ok(PollOutcome::Fetched {
			range,
			published,
			skipped,
		})
	}

	async fn ingest_range(&self, range: BlockRange) -> Result<(usize, usize), IngestError> {
		let filter = LogFilter::for_addresses(self.feed.addresses.clone()).with_range(range.from, range.to);
		let logs = self.source.get_logs(&filter).await?;

		let mut published = 0;
		let mut skipped = 0;
		for log in logs {
			if log.removed {
				debug!(feed = %self.feed.name, "Skipping removed log in block {}", log.block_number);
				skipped += 1;
				continue;
			}

			match self.feed.registry.decode(&log) {
				Ok(decoded) => {
					self.sink.publish(LedgerEvent::from_decoded(decoded, &log)).await?;
					published += 1;
				}
				Err(DecodeError::UnknownSignature(_) | DecodeError::NoTopics) => {
					skipped += 1;
				}
				Err(e) => {
					warn!(
						feed = %self.feed.name,
						"Skipping undecodable log {:#x}:{} in block {}: {}",
						log.transaction_hash, log.log_index, log.block_number, e
					);
					skipped += 1;
				}
			}
		}
		Ok((published, skipped))
	}

	/// Load the stored cursor, retrying with backoff. Once the policy gives up the
	/// poller keeps its configured start block. Returns `false` if cancelled first.
	async fn restore_or_fall_back(&mut self, cancel: &CancellationToken) -> bool {
		let mut backoff = self.retry.backoff();
		loop {
			let error = match self.restore().await {
				Ok(()) => return true,
				Err(e) => e,
			};
			let Some(delay) = backoff.next_backoff() else {
				warn!(
					feed = %self.feed.name,
					"Cursor unavailable, polling from block {}: {}",
					self.tracker.last_block() + 1,
					error
				);
				return true;
			};
			warn!(feed = %self.feed.name, "Failed to load cursor, retrying in {:?}: {}", delay, error);
			tokio::select! {
				_ = cancel.cancelled() => return false,
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}

	/// Poll until cancelled. Errors are logged and the range is retried next tick.
	pub async fn run(mut self, cancel: CancellationToken) {
		if !self.restore_or_fall_back(&cancel).await {
			return;
		}

		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {
					if let Err(e) = self.poll_once().await {
						warn!(feed = %self.feed.name, "Poll failed: {}", e);
					}
				}
			}
		}

		info!(feed = %self.feed.name, "Poller stopped at block {}", self.tracker.last_block());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::abi::contracts::bundled_abis;
	use crate::abi::event_topic;
	use crate::events::MemoryCursorStore;
	use crate::ledger::{LedgerError, Log, LogSubscription};
	use async_trait::async_trait;
	use primitive_types::{H256, U256};
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

	#[derive(Default)]
	struct ScriptedSource {
		tip: AtomicU64,
		logs: Mutex<Vec<Log>>,
		queries: Mutex<Vec<(u64, u64)>>,
		fail_queries: AtomicBool,
	}

	#[async_trait]
	impl LogSource for ScriptedSource {
		async fn block_number(&self) -> Result<u64, LedgerError> {
			Ok(self.tip.load(Ordering::SeqCst))
		}

		async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LedgerError> {
			let (from, to) = (filter.from_block.unwrap_or(0), filter.to_block.unwrap_or(u64::MAX));
			self.queries.lock().unwrap().push((from, to));
			if self.fail_queries.load(Ordering::SeqCst) {
				return Err(LedgerError::InvalidResponse("node unavailable".into()));
			}
			Ok(self
				.logs
				.lock()
				.unwrap()
				.iter()
				.filter(|log| log.block_number >= from && log.block_number <= to)
				.cloned()
				.collect())
		}

		async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogSubscription, LedgerError> {
			Err(LedgerError::SubscriptionClosed("not scripted".into()))
		}
	}

	#[derive(Default)]
	struct CollectingSink {
		events: Mutex<Vec<LedgerEvent>>,
	}

	#[async_trait]
	impl EventSink for CollectingSink {
		async fn publish(&self, event: LedgerEvent) -> Result<(), IngestError> {
			self.events.lock().unwrap().push(event);
			Ok(())
		}
	}

	fn deposit_log(block: u64, amount: U256) -> Log {
		let mut data = vec![0u8; 32];
		amount.to_big_endian(&mut data);
		Log {
			address: H160::repeat_byte(0x42),
			topics: vec![
				event_topic("DepositedEther(address,uint256)"),
				H256::from(H160::repeat_byte(0x07)),
			],
			data,
			block_number: block,
			transaction_hash: H256::repeat_byte(block as u8),
			block_hash: H256::repeat_byte(0xbb),
			transaction_index: 0,
			log_index: 0,
			removed: false,
		}
	}

	fn unknown_log(block: u64) -> Log {
		Log {
			topics: vec![event_topic("Unrelated(uint256)")],
			data: vec![0u8; 32],
			..deposit_log(block, U256::zero())
		}
	}

	fn proposal_feed() -> Feed {
		let abis = bundled_abis().unwrap();
		let (name, abi) = abis.into_iter().find(|(name, _)| *name == "Proposal").unwrap();
		Feed {
			name: name.to_string(),
			addresses: vec![H160::repeat_byte(0x42)],
			registry: Arc::new(EventRegistry::from_abi(&abi)),
		}
	}

	fn poller(source: Arc<ScriptedSource>, sink: Arc<CollectingSink>, start: u64) -> EventPoller {
		EventPoller::new(proposal_feed(), source, sink, Arc::new(MemoryCursorStore::new()), start)
	}

	#[tokio::test]
	async fn queries_exactly_the_range_after_the_cursor() {
		let source = Arc::new(ScriptedSource::default());
		source.tip.store(12, Ordering::SeqCst);
		let sink = Arc::new(CollectingSink::default());
		let mut poller = poller(source.clone(), sink, 10);

		let outcome = poller.poll_once().await.unwrap();

		assert!(matches!(outcome, PollOutcome::Fetched { range: BlockRange { from: 11, to: 12 }, .. }));
		assert_eq!(*source.queries.lock().unwrap(), vec![(11, 12)]);
		assert_eq!(poller.cursor(), 12);
	}

	#[tokio::test]
	async fn unchanged_tip_issues_no_query() {
		let source = Arc::new(ScriptedSource::default());
		source.tip.store(10, Ordering::SeqCst);
		let mut poller = poller(source.clone(), Arc::new(CollectingSink::default()), 10);

		assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::UpToDate);
		assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Idle);
		assert!(source.queries.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn failed_query_leaves_cursor_for_retry() {
		let source = Arc::new(ScriptedSource::default());
		source.tip.store(12, Ordering::SeqCst);
		source.fail_queries.store(true, Ordering::SeqCst);
		let mut poller = poller(source.clone(), Arc::new(CollectingSink::default()), 10);

		assert!(poller.poll_once().await.is_err());
		assert_eq!(poller.cursor(), 10);

		source.fail_queries.store(false, Ordering::SeqCst);
		poller.poll_once().await.unwrap();
		assert_eq!(*source.queries.lock().unwrap(), vec![(11, 12), (11, 12)]);
		assert_eq!(poller.cursor(), 12);
	}

	#[tokio::test]
	async fn unknown_signatures_are_skipped_and_known_ones_published() {
		let source = Arc::new(ScriptedSource::default());
		let amount = U256::from_dec_str("1500000000000000000").unwrap();
		source.logs.lock().unwrap().extend([unknown_log(11), deposit_log(12, amount)]);
		source.tip.store(12, Ordering::SeqCst);
		let sink = Arc::new(CollectingSink::default());
		let mut poller = poller(source, sink.clone(), 10);

		let outcome = poller.poll_once().await.unwrap();
		assert!(matches!(outcome, PollOutcome::Fetched { published: 1, skipped: 1, .. }));

		let events = sink.events.lock().unwrap();
		assert_eq!(events[0].name, "DepositedEther");
		assert_eq!(events[0].block_number, 12);
		assert_eq!(events[0].fields["amount"].as_str(), Some("1500000000000000000"));
	}

	#[tokio::test]
	async fn blocks_at_or_below_cursor_are_never_reemitted() {
		let source = Arc::new(ScriptedSource::default());
		source.logs.lock().unwrap().push(deposit_log(11, U256::one()));
		source.tip.store(11, Ordering::SeqCst);
		let sink = Arc::new(CollectingSink::default());
		let mut poller = poller(source.clone(), sink.clone(), 10);

		poller.poll_once().await.unwrap();
		source.tip.store(13, Ordering::SeqCst);
		poller.poll_once().await.unwrap();

		assert_eq!(sink.events.lock().unwrap().len(), 1);
		assert_eq!(*source.queries.lock().unwrap(), vec![(11, 11), (12, 13)]);
	}

	#[tokio::test]
	async fn restore_resumes_from_stored_cursor() {
		let store = Arc::new(MemoryCursorStore::new());
		store.save("Proposal", 20).await.unwrap();
		let source = Arc::new(ScriptedSource::default());
		source.tip.store(21, Ordering::SeqCst);

		let mut poller = EventPoller::new(
			proposal_feed(),
			source.clone(),
			Arc::new(CollectingSink::default()),
			store.clone(),
			0,
		);
		poller.restore().await.unwrap();
		poller.poll_once().await.unwrap();

		assert_eq!(*source.queries.lock().unwrap(), vec![(21, 21)]);
		assert_eq!(store.load("Proposal").await.unwrap(), Some(21));
	}

	struct UnreachableStore;

	#[async_trait]
	impl CursorStore for UnreachableStore {
		async fn load(&self, _feed: &str) -> Result<Option<u64>, IngestError> {
			Err(IngestError::CursorStore("disk unavailable".into()))
		}

		async fn save(&self, _feed: &str, _last_block: u64) -> Result<(), IngestError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn unreadable_cursor_falls_back_to_start_block() {
		let source = Arc::new(ScriptedSource::default());
		source.logs.lock().unwrap().push(deposit_log(11, U256::one()));
		source.tip.store(12, Ordering::SeqCst);
		let sink = Arc::new(CollectingSink::default());
		let poller = EventPoller::new(proposal_feed(), source.clone(), sink.clone(), Arc::new(UnreachableStore), 10)
			.with_interval(Duration::from_millis(5))
			.with_retry(RetryPolicy::new(
				Duration::from_millis(1),
				Duration::from_millis(5),
				Some(Duration::from_millis(20)),
			));

		let cancel = CancellationToken::new();
		let task = tokio::spawn(poller.run(cancel.clone()));
		tokio::time::timeout(Duration::from_secs(2), async {
			while sink.events.lock().unwrap().is_empty() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(source.queries.lock().unwrap()[0], (11, 12));
		assert_eq!(sink.events.lock().unwrap()[0].block_number, 11);
	}
}
