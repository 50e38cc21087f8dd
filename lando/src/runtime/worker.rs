use serde::{Deserialize, Serialize};

/// Configuration for one inbox consumer in the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Unique identifier for this consumer, recorded on the leases it takes.
    pub consumer_id: String,
    /// Queue the consumer reads commands from.
    pub queue: String,
    /// Wait before requeueing a command whose job another consumer holds,
    /// in milliseconds.
    pub lease_retry_delay_ms: u64,
}

impl ConsumerConfig {
    /// Create a consumer configuration for `queue`.
    pub fn new(consumer_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            queue: queue.into(),
            lease_retry_delay_ms: 50,
        }
    }

    /// Set the lease retry delay.
    pub fn with_lease_retry_delay(mut self, ms: u64) -> Self {
        self.lease_retry_delay_ms = ms;
        self
    }

    pub fn lease_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lease_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_delay() {
        let config = ConsumerConfig::new("c0", "lando").with_lease_retry_delay(5);
        assert_eq!(config.consumer_id, "c0");
        assert_eq!(config.queue, "lando");
        assert_eq!(config.lease_retry_delay(), std::time::Duration::from_millis(5));
        assert_eq!(ConsumerConfig::new("c1", "q").lease_retry_delay_ms, 50);
    }
}
