use super::EventMessage;
use crate::broker::{BrokerError, BrokerHandle, ConsumeOptions, Consumer, EVENTS_QUEUE, QueueSpec};
use crate::utils::RetryPolicy;

use backoff::backoff::Backoff;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded, in-order record of consumed events. Oldest entries are evicted first.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<VecDeque<EventMessage>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, event: EventMessage) {
        let mut events = self.events.write().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Every retained event, oldest first.
    pub async fn snapshot(&self) -> Vec<EventMessage> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Downstream consumer of the event queue.
///
/// Each message is acknowledged only after it is recorded, so a crash before
/// recording leaves it on the queue. Messages that are not valid events are
/// rejected without requeue.
pub struct EventConsumer {
    broker: Arc<BrokerHandle>,
    queue: String,
    log: EventLog,
    retry: RetryPolicy,
}

impl EventConsumer {
    pub fn new(broker: Arc<BrokerHandle>, log: EventLog) -> Self {
        Self {
            broker,
            queue: EVENTS_QUEUE.to_string(),
            log,
            retry: RetryPolicy::unbounded(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn open(&self) -> Result<Box<dyn Consumer>, BrokerError> {
        let broker = self.broker.get().await?;
        broker.declare_queue(&QueueSpec::durable(self.queue.as_str())).await?;
        broker.consume(&self.queue, ConsumeOptions::manual_ack()).await
    }

    /// Consume until cancelled, reopening the consumer whenever it closes.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = self.retry.backoff();
        while !cancel.is_cancelled() {
            let mut consumer = match self.open().await {
                Ok(consumer) => {
                    info!(queue = %self.queue, "Consuming events");
                    backoff.reset();
                    consumer
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
                    warn!(queue = %self.queue, "Event consumer unavailable, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = consumer.cancel().await {
                            warn!(queue = %self.queue, "Failed to cancel event consumer: {}", e);
                        }
                        info!(queue = %self.queue, "Event consumer stopped");
                        return;
                    }
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            let result = match serde_json::from_slice::<EventMessage>(delivery.body()) {
                                Ok(event) => {
                                    info!(
                                        "Received event {} at block {} (tx {:#x}, log {}): {}",
                                        event.event_name,
                                        event.block_number,
                                        event.transaction_hash,
                                        event.log_index,
                                        serde_json::to_string(&event.data).unwrap_or_default()
                                    );
                                    self.log.record(event).await;
                                    delivery.ack().await
                                }
                                Err(e) => {
                                    warn!(queue = %self.queue, "Rejecting malformed event message: {}", e);
                                    delivery.nack(false).await
                                }
                            };
                            if let Err(e) = result {
                                warn!(queue = %self.queue, "Failed to settle event message: {}", e);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(queue = %self.queue, "Event consumer error: {}", e);
                            break;
                        }
                        None => {
                            warn!(queue = %self.queue, "Event consumer closed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
