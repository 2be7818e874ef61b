use super::{EventMessage, EventSink, IngestError, LedgerEvent};
use crate::broker::{BrokerHandle, EVENTS_QUEUE, Envelope, QueueSpec};
use crate::utils::RetryPolicy;

use async_trait::async_trait;
use backoff::future::retry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands decoded events to the durable event queue.
///
/// Shared by every poller feed and the subscriber. Publishes go through the
/// process-wide [`BrokerHandle`]; connection and publish failures are retried with
/// backoff and the connection is replaced when it is found closed.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<BrokerHandle>,
    queue: String,
    retry: RetryPolicy,
}

impl EventPublisher {
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self {
            broker,
            queue: EVENTS_QUEUE.to_string(),
            retry: RetryPolicy::default_network(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Serialize and publish one event.
    pub async fn publish(&self, event: LedgerEvent) -> Result<(), IngestError> {
        let block = event.block_number;
        let log_index = event.log_index;
        let message = EventMessage::from(event);
        let body = serde_json::to_vec(&message)?;

        retry(self.retry.backoff(), || async {
            let broker = self.broker.get().await.map_err(backoff::Error::transient)?;
            let attempt = async {
                broker.declare_queue(&QueueSpec::durable(self.queue.as_str())).await?;
                broker.publish(&self.queue, Envelope::json(body.clone())).await
            };
            attempt.await.map_err(|e| {
                warn!(
                    queue = %self.queue,
                    "Publishing {} (block {}, log {}) failed: {}",
                    message.event_name, block, log_index, e
                );
                backoff::Error::transient(e)
            })
        })
        .await?;

        debug!(
            queue = %self.queue,
            "Published {} from block {} log {}",
            message.event_name, block, log_index
        );
        Ok(())
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish(&self, event: LedgerEvent) -> Result<(), IngestError> {
        EventPublisher::publish(self, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{FieldMap, FieldValue};
    use crate::broker::{Broker, ConsumeOptions, InMemoryBroker};
    use primitive_types::{H160, H256};
    use std::time::Duration;

    fn event(block: u64) -> LedgerEvent {
        let mut fields = FieldMap::new();
        fields.insert("proposalId".into(), FieldValue::Unsigned(block));
        LedgerEvent {
            name: "ProposalApproved".into(),
            fields,
            block_number: block,
            transaction_hash: H256::repeat_byte(1),
            block_hash: H256::repeat_byte(2),
            transaction_index: 0,
            log_index: 0,
            address: H160::repeat_byte(3),
        }
    }

    #[tokio::test]
    async fn concurrent_publishes_all_reach_the_event_queue() {
        let broker = InMemoryBroker::new();
        let handle = Arc::new(BrokerHandle::new(Arc::new(broker.clone())));
        let publisher = EventPublisher::new(handle);

        let tasks: Vec<_> = (1..=10)
            .map(|block| {
                let publisher = publisher.clone();
                tokio::spawn(async move { publisher.publish(event(block)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut consumer = broker.consume(EVENTS_QUEUE, ConsumeOptions::auto_ack()).await.unwrap();
        let mut blocks = Vec::new();
        for _ in 0..10 {
            let delivery = consumer.next().await.unwrap().unwrap();
            let message: EventMessage = serde_json::from_slice(delivery.body()).unwrap();
            assert_eq!(message.event_name, "ProposalApproved");
            blocks.push(message.block_number);
        }
        blocks.sort_unstable();
        assert_eq!(blocks, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn publish_fails_once_retries_are_exhausted() {
        let fast = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), Some(Duration::from_millis(20)));
        let broker = InMemoryBroker::new();
        broker.close().await.unwrap();
        let handle = Arc::new(BrokerHandle::new(Arc::new(broker)).with_retry(fast));
        let publisher = EventPublisher::new(handle).with_retry(fast);

        assert!(matches!(
            publisher.publish(event(1)).await,
            Err(IngestError::Broker(_))
        ));
    }
}
