//! In-process broker with AMQP-like queue semantics.
//!
//! Each queue is a single channel shared by all of its consumers, so consumers compete
//! for messages and every message goes to exactly one of them. Unacknowledged
//! deliveries go back on the queue when they are rejected with requeue or dropped.

use super::handle::Connector;
use super::types::*;
use super::{Broker, Consumer};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

struct Message {
	envelope: Envelope,
	redelivered: bool,
}

struct QueueState {
	name: String,
	sender: mpsc::UnboundedSender<Message>,
	receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
	exclusive: bool,
	auto_delete: bool,
	consumers: AtomicUsize,
	exclusive_consumer: AtomicBool,
}

struct Inner {
	queues: StdMutex<HashMap<String, Arc<QueueState>>>,
	open: AtomicBool,
	closed: CancellationToken,
}

impl Inner {
	fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<QueueState>>> {
		self.queues.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn ensure_open(&self) -> Result<(), BrokerError> {
		if self.open.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(BrokerError::Closed)
		}
	}
}

/// Broker that keeps all queues in process memory.
///
/// Clones share the same queues, which lets a gateway and a worker in one process
/// (or in one test) talk to each other.
#[derive(Clone)]
pub struct InMemoryBroker {
	inner: Arc<Inner>,
}

impl InMemoryBroker {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				queues: StdMutex::new(HashMap::new()),
				open: AtomicBool::new(true),
				closed: CancellationToken::new(),
			}),
		}
	}

	/// Number of messages waiting in `queue`, if it exists and no consumer is
	/// currently blocked on it.
	pub fn queue_depth(&self, queue: &str) -> Option<usize> {
		let state = self.inner.queues().get(queue).cloned()?;
		let receiver = state.receiver.try_lock().ok()?;
		Some(receiver.len())
	}

	/// Whether a queue with this name is currently declared.
	pub fn has_queue(&self, queue: &str) -> bool {
		self.inner.queues().contains_key(queue)
	}
}

impl Default for InMemoryBroker {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Broker for InMemoryBroker {
	async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
		self.inner.ensure_open()?;

		let name = spec
			.name
			.clone()
			.unwrap_or_else(|| format!("amq.gen-{}", Uuid::new_v4().simple()));

		let mut queues = self.inner.queues();
		queues.entry(name.clone()).or_insert_with(|| {
			debug!("Declaring in-memory queue {}", name);
			let (sender, receiver) = mpsc::unbounded_channel();
			Arc::new(QueueState {
				name: name.clone(),
				sender,
				receiver: Mutex::new(receiver),
				exclusive: spec.exclusive,
				auto_delete: spec.auto_delete,
				consumers: AtomicUsize::new(0),
				exclusive_consumer: AtomicBool::new(false),
			})
		});
		Ok(name)
	}

	async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError> {
		self.inner.ensure_open()?;

		let state = self
			.inner
			.queues()
			.get(queue)
			.cloned()
			.ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

		state
			.sender
			.send(Message {
				envelope,
				redelivered: false,
			})
			.map_err(|_| BrokerError::Closed)
	}

	async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Box<dyn Consumer>, BrokerError> {
		self.inner.ensure_open()?;

		let queues = self.inner.queues();
		let state = queues
			.get(queue)
			.cloned()
			.ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

		let exclusive = options.exclusive || state.exclusive;
		if state.exclusive_consumer.load(Ordering::SeqCst)
			|| (exclusive && state.consumers.load(Ordering::SeqCst) > 0)
		{
			return Err(BrokerError::ExclusiveQueueInUse(queue.to_string()));
		}

		state.consumers.fetch_add(1, Ordering::SeqCst);
		if exclusive {
			state.exclusive_consumer.store(true, Ordering::SeqCst);
		}
		drop(queues);

		Ok(Box::new(MemoryConsumer {
			broker: self.inner.clone(),
			queue: state,
			auto_ack: options.auto_ack,
			exclusive,
		}))
	}

	fn is_open(&self) -> bool {
		self.inner.open.load(Ordering::SeqCst)
	}

	async fn close(&self) -> Result<(), BrokerError> {
		self.inner.open.store(false, Ordering::SeqCst);
		self.inner.closed.cancel();
		self.inner.queues().clear();
		Ok(())
	}
}

#[async_trait]
impl Connector for InMemoryBroker {
	async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
		self.inner.ensure_open()?;
		Ok(Arc::new(self.clone()))
	}
}

struct MemoryConsumer {
	broker: Arc<Inner>,
	queue: Arc<QueueState>,
	auto_ack: bool,
	exclusive: bool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
	async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
		if !self.broker.open.load(Ordering::SeqCst) {
			return None;
		}

		let closed = self.broker.closed.clone();
		let mut receiver = tokio::select! {
			_ = closed.cancelled() => return None,
			guard = self.queue.receiver.lock() => guard,
		};
		let message = tokio::select! {
			_ = closed.cancelled() => return None,
			message = receiver.recv() => message?,
		};
		drop(receiver);

		let acker: Option<Box<dyn Acker>> = if self.auto_ack {
			None
		} else {
			Some(Box::new(MemoryAcker {
				pending: Some(message.envelope.clone()),
				sender: self.queue.sender.clone(),
			}))
		};
		Some(Ok(Delivery::new(message.envelope, message.redelivered, acker)))
	}

	async fn cancel(self: Box<Self>) -> Result<(), BrokerError> {
		Ok(())
	}
}

impl Drop for MemoryConsumer {
	fn drop(&mut self) {
		let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
		if self.exclusive {
			self.queue.exclusive_consumer.store(false, Ordering::SeqCst);
		}
		if self.queue.auto_delete && remaining == 0 {
			let mut queues = self.broker.queues();
			if queues
				.get(&self.queue.name)
				.is_some_and(|q| Arc::ptr_eq(q, &self.queue))
			{
				debug!("Auto-deleting in-memory queue {}", self.queue.name);
				queues.remove(&self.queue.name);
			}
		}
	}
}

struct MemoryAcker {
	pending: Option<Envelope>,
	sender: mpsc::UnboundedSender<Message>,
}

impl MemoryAcker {
	fn requeue(&mut self) {
		if let Some(envelope) = self.pending.take() {
			let _ = self.sender.send(Message {
				envelope,
				redelivered: true,
			});
		}
	}
}

#[async_trait]
impl Acker for MemoryAcker {
	async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
		self.pending = None;
		Ok(())
	}

	async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
		if requeue {
			self.requeue();
		} else {
			self.pending = None;
		}
		Ok(())
	}
}

impl Drop for MemoryAcker {
	fn drop(&mut self) {
		self.requeue();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::time::Duration;

	async fn next_body(consumer: &mut Box<dyn Consumer>) -> Vec<u8> {
		let delivery = tokio::time::timeout(Duration::from_secs(1), consumer.next())
			.await
			.expect("delivery within timeout")
			.expect("consumer open")
			.expect("delivery ok");
		let body = delivery.body().to_vec();
		delivery.ack().await.unwrap();
		body
	}

	#[tokio::test]
	async fn competing_consumers_each_message_delivered_once() {
		let broker = InMemoryBroker::new();
		broker.declare_queue(&QueueSpec::durable("work")).await.unwrap();
		let mut a = broker.consume("work", ConsumeOptions::manual_ack()).await.unwrap();
		let mut b = broker.consume("work", ConsumeOptions::manual_ack()).await.unwrap();

		for i in 0..4u8 {
			broker.publish("work", Envelope::json(vec![i])).await.unwrap();
		}

		let mut seen = HashSet::new();
		seen.insert(next_body(&mut a).await);
		seen.insert(next_body(&mut b).await);
		seen.insert(next_body(&mut a).await);
		seen.insert(next_body(&mut b).await);
		assert_eq!(seen.len(), 4);
		assert_eq!(broker.queue_depth("work"), Some(0));
	}

	#[tokio::test]
	async fn publish_to_undeclared_queue_fails() {
		let broker = InMemoryBroker::new();
		let err = broker.publish("missing", Envelope::json(vec![])).await.unwrap_err();
		assert!(matches!(err, BrokerError::QueueNotFound(name) if name == "missing"));
	}

	#[tokio::test]
	async fn generated_names_are_unique() {
		let broker = InMemoryBroker::new();
		let a = broker.declare_queue(&QueueSpec::private_reply()).await.unwrap();
		let b = broker.declare_queue(&QueueSpec::private_reply()).await.unwrap();
		assert_ne!(a, b);
		assert!(a.starts_with("amq.gen-"));
	}

	#[tokio::test]
	async fn exclusive_queue_refuses_second_consumer() {
		let broker = InMemoryBroker::new();
		let name = broker.declare_queue(&QueueSpec::private_reply()).await.unwrap();
		let _first = broker.consume(&name, ConsumeOptions::auto_ack()).await.unwrap();
		let err = broker.consume(&name, ConsumeOptions::auto_ack()).await.err().unwrap();
		assert!(matches!(err, BrokerError::ExclusiveQueueInUse(_)));
	}

	#[tokio::test]
	async fn auto_delete_queue_removed_with_its_consumer() {
		let broker = InMemoryBroker::new();
		let name = broker.declare_queue(&QueueSpec::private_reply()).await.unwrap();
		let consumer = broker.consume(&name, ConsumeOptions::auto_ack()).await.unwrap();
		assert!(broker.has_queue(&name));

		consumer.cancel().await.unwrap();
		assert!(!broker.has_queue(&name));
		assert!(broker.publish(&name, Envelope::json(vec![])).await.is_err());
	}

	#[tokio::test]
	async fn dropped_delivery_is_redelivered() {
		let broker = InMemoryBroker::new();
		broker.declare_queue(&QueueSpec::durable("events")).await.unwrap();
		broker.publish("events", Envelope::json(b"e1".to_vec())).await.unwrap();

		let mut consumer = broker.consume("events", ConsumeOptions::manual_ack()).await.unwrap();
		let first = consumer.next().await.unwrap().unwrap();
		assert!(!first.redelivered);
		drop(first);

		let second = consumer.next().await.unwrap().unwrap();
		assert!(second.redelivered);
		assert_eq!(second.body(), b"e1");
		second.ack().await.unwrap();
		assert_eq!(broker.queue_depth("events"), Some(0));
	}

	#[tokio::test]
	async fn nack_without_requeue_discards() {
		let broker = InMemoryBroker::new();
		broker.declare_queue(&QueueSpec::durable("events")).await.unwrap();
		broker.publish("events", Envelope::json(b"bad".to_vec())).await.unwrap();

		let mut consumer = broker.consume("events", ConsumeOptions::manual_ack()).await.unwrap();
		consumer.next().await.unwrap().unwrap().nack(false).await.unwrap();
		assert_eq!(broker.queue_depth("events"), Some(0));
	}

	#[tokio::test]
	async fn close_ends_waiting_consumers() {
		let broker = InMemoryBroker::new();
		broker.declare_queue(&QueueSpec::durable("events")).await.unwrap();
		let mut consumer = broker.consume("events", ConsumeOptions::auto_ack()).await.unwrap();

		let waiter = tokio::spawn(async move { consumer.next().await.is_none() });
		tokio::task::yield_now().await;
		broker.close().await.unwrap();

		assert!(waiter.await.unwrap());
		assert!(!broker.is_open());
		assert!(matches!(
			broker.publish("events", Envelope::json(vec![])).await,
			Err(BrokerError::Closed)
		));
	}
}
