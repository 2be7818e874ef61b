use backoff::ExponentialBackoff;
use std::time::Duration;

/// Exponential backoff settings shared by broker connects, publishes and ledger
/// resubscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this long; `None` retries until cancelled.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration, max_elapsed: Option<Duration>) -> Self {
        let initial_interval = initial_interval.max(Duration::from_millis(1));
        Self {
            initial_interval,
            max_interval: max_interval.max(initial_interval),
            max_elapsed,
        }
    }

    /// Policy for reaching network services at startup or after a drop.
    pub fn default_network() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5), Some(Duration::from_secs(60)))
    }

    /// Policy that keeps retrying; the caller is expected to stop it through cancellation.
    pub fn unbounded() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), None)
    }

    /// Fresh `backoff` state for one retry sequence.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: self.max_elapsed,
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_network()
    }
}
