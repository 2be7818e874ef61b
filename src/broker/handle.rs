//! Shared, lazily connected broker.
//!
//! The connection is opened on first use. Concurrent first callers wait on the same
//! attempt, so exactly one connection is established. A failed attempt is not
//! remembered: the next caller tries again. A connection found closed is replaced.

use super::Broker;
use super::types::BrokerError;
use crate::utils::RetryPolicy;

use async_trait::async_trait;
use backoff::future::retry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Process-wide broker connection, created on demand.
pub struct BrokerHandle {
	connector: Arc<dyn Connector>,
	current: Mutex<Option<Arc<dyn Broker>>>,
	retry: RetryPolicy,
	closed: AtomicBool,
}

impl BrokerHandle {
	pub fn new(connector: Arc<dyn Connector>) -> Self {
		Self {
			connector,
			current: Mutex::new(None),
			retry: RetryPolicy::default_network(),
			closed: AtomicBool::new(false),
		}
	}

	/// Override how connection attempts are retried.
	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Return the open connection, connecting first if needed.
	///
	/// # Returns
	///
	/// The shared connection, or the last connection error once the retry policy
	/// gives up. Fails with [`BrokerError::Closed`] after [`BrokerHandle::close`].
	pub async fn get(&self) -> Result<Arc<dyn Broker>, BrokerError> {
		let mut current = self.current.lock().await;
		if self.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::Closed);
		}

		if let Some(broker) = current.as_ref() {
			if broker.is_open() {
				return Ok(broker.clone());
			}
			warn!("Broker connection lost, reconnecting");
			if let Some(stale) = current.take() {
				if let Err(e) = stale.close().await {
					debug!("Closing stale broker connection failed: {}", e);
				}
			}
		}

		let broker = retry(self.retry.backoff(), || async {
			self.connector.connect().await.map_err(|e| {
				warn!("Broker connection attempt failed: {}", e);
				backoff::Error::transient(e)
			})
		})
		.await?;

		info!("Broker connection established");
		*current = Some(broker.clone());
		Ok(broker)
	}

	/// Close the connection, if one was opened. Later `get` calls fail.
	pub async fn close(&self) -> Result<(), BrokerError> {
		let mut current = self.current.lock().await;
		self.closed.store(true, Ordering::SeqCst);
		match current.take() {
			Some(broker) => {
				info!("Closing broker connection");
				broker.close().await
			}
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::{ConsumeOptions, Consumer, Envelope, InMemoryBroker, QueueSpec};
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	struct CountingConnector {
		attempts: AtomicUsize,
		failures_left: AtomicUsize,
	}

	impl CountingConnector {
		fn new(failures: usize) -> Arc<Self> {
			Arc::new(Self {
				attempts: AtomicUsize::new(0),
				failures_left: AtomicUsize::new(failures),
			})
		}

		fn attempts(&self) -> usize {
			self.attempts.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl Connector for CountingConnector {
		async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			let failing = self
				.failures_left
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok();
			if failing {
				return Err(BrokerError::ConnectionError("refused".into()));
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
			Ok(Arc::new(InMemoryBroker::new()))
		}
	}

	fn fast_retry(max_elapsed: Duration) -> RetryPolicy {
		RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), Some(max_elapsed))
	}

	#[tokio::test]
	async fn concurrent_first_use_connects_once() {
		let connector = CountingConnector::new(0);
		let handle = Arc::new(BrokerHandle::new(connector.clone()));

		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let handle = handle.clone();
				tokio::spawn(async move { handle.get().await.is_ok() })
			})
			.collect();
		for task in tasks {
			assert!(task.await.unwrap());
		}
		assert_eq!(connector.attempts(), 1);
	}

	#[tokio::test]
	async fn transient_connect_failures_are_retried() {
		let connector = CountingConnector::new(2);
		let handle = BrokerHandle::new(connector.clone()).with_retry(fast_retry(Duration::from_secs(5)));

		assert!(handle.get().await.is_ok());
		assert_eq!(connector.attempts(), 3);
	}

	#[tokio::test]
	async fn failed_connect_is_not_cached() {
		let connector = CountingConnector::new(usize::MAX);
		let handle = BrokerHandle::new(connector.clone()).with_retry(fast_retry(Duration::from_millis(20)));

		assert!(handle.get().await.is_err());
		connector.failures_left.store(0, Ordering::SeqCst);
		assert!(handle.get().await.is_ok());
	}

	#[tokio::test]
	async fn closed_connection_is_replaced() {
		let connector = CountingConnector::new(0);
		let handle = BrokerHandle::new(connector.clone());

		let first = handle.get().await.unwrap();
		first.close().await.unwrap();
		let second = handle.get().await.unwrap();

		assert!(second.is_open());
		assert_eq!(connector.attempts(), 2);
	}

	#[tokio::test]
	async fn get_fails_after_close() {
		let handle = BrokerHandle::new(CountingConnector::new(0));
		handle.get().await.unwrap();
		handle.close().await.unwrap();
		assert!(matches!(handle.get().await, Err(BrokerError::Closed)));
	}

	/// Connection that stays up while its channel dies on the first failed declare.
	struct ChannelFaultBroker {
		channel_open: AtomicBool,
		closes: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Broker for ChannelFaultBroker {
		async fn declare_queue(&self, _spec: &QueueSpec) -> Result<String, BrokerError> {
			self.channel_open.store(false, Ordering::SeqCst);
			Err(BrokerError::PublishError("PRECONDITION_FAILED".into()))
		}

		async fn publish(&self, _queue: &str, _envelope: Envelope) -> Result<(), BrokerError> {
			Err(BrokerError::Closed)
		}

		async fn consume(&self, _queue: &str, _options: ConsumeOptions) -> Result<Box<dyn Consumer>, BrokerError> {
			Err(BrokerError::Closed)
		}

		fn is_open(&self) -> bool {
			self.channel_open.load(Ordering::SeqCst)
		}

		async fn close(&self) -> Result<(), BrokerError> {
			self.closes.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	struct ChannelFaultConnector {
		attempts: AtomicUsize,
		closes: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Connector for ChannelFaultConnector {
		async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			Ok(Arc::new(ChannelFaultBroker {
				channel_open: AtomicBool::new(true),
				closes: self.closes.clone(),
			}))
		}
	}

	#[tokio::test]
	async fn dead_channel_is_replaced_and_closed() {
		let connector = Arc::new(ChannelFaultConnector {
			attempts: AtomicUsize::new(0),
			closes: Arc::new(AtomicUsize::new(0)),
		});
		let handle = BrokerHandle::new(connector.clone());

		let first = handle.get().await.unwrap();
		assert!(first.declare_queue(&QueueSpec::durable("approval_queue")).await.is_err());

		let second = handle.get().await.unwrap();
		assert!(second.is_open());
		assert!(!Arc::ptr_eq(&first, &second));
		assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
		assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
	}
}
