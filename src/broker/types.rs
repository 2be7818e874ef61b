use async_trait::async_trait;
use thiserror::Error;

/// Content type stamped on every JSON message the bridge sends.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Queue declaration parameters.
///
/// Declaring an existing queue is idempotent and returns its name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; `None` asks the broker to generate one.
    pub name: Option<String>,
    /// Survives broker restarts.
    pub durable: bool,
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A named queue that survives restarts.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            ..Default::default()
        }
    }

    /// A broker-named, private queue removed with its consumer. Used for replies.
    pub fn private_reply() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A message body plus the routing metadata request/reply needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl Envelope {
    /// JSON body without routing metadata.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Consumer registration parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged once handed out.
    pub auto_ack: bool,
    /// Refuse other consumers on the same queue while this one is active.
    pub exclusive: bool,
}

impl ConsumeOptions {
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            exclusive: false,
        }
    }

    pub fn manual_ack() -> Self {
        Self::default()
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A message taken from a queue.
///
/// With manual acknowledgement the message stays owned by the broker until
/// [`Delivery::ack`] or [`Delivery::nack`] is called.
pub struct Delivery {
    pub envelope: Envelope,
    pub redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Option<Box<dyn Acker>>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    /// Acknowledge the message. No-op for auto-ack deliveries.
    pub async fn ack(mut self) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the message, optionally putting it back on the queue.
    pub async fn nack(mut self, requeue: bool) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} already has an exclusive consumer")]
    ExclusiveQueueInUse(String),

    #[error("Broker connection is closed")]
    Closed,

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("AMQP error: {0}")]
    AmqpError(#[from] lapin::Error),
}
