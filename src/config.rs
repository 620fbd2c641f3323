//! Construction-time configuration for a [`crate::consumer::Consumer`].

use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

impl SubscriptionType {
    /// Shared and KeyShared subscriptions support per-message redelivery; Exclusive and
    /// Failover only ever redeliver the whole unacked set.
    pub fn supports_selective_redelivery(self) -> bool {
        matches!(self, SubscriptionType::Shared | SubscriptionType::KeyShared)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionInitialPosition {
    Latest,
    Earliest,
}

/// Immutable, validated configuration for one partition consumer.
///
/// Construct via [`ConsumerConfigurationBuilder`]; there is no public way to build an
/// unvalidated instance.
#[derive(Debug, Clone)]
pub struct ConsumerConfiguration {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub subscription_initial_position: SubscriptionInitialPosition,
    pub receiver_queue_size: u32,
    pub ack_timeout: Duration,
    pub ack_timeout_tick: Duration,
    pub ack_group_time: Duration,
    pub read_compacted: bool,
    pub consumer_name: Option<String>,
    pub is_persistent_topic: bool,
    /// True when this consumer is one of several partition consumers owned by a parent
    /// multi-topic/multi-partition aggregator that itself sends the initial flow
    /// permits for a durable subscription.
    pub has_parent_consumer: bool,
    /// How long the initial subscribe may spend retrying before the static initialiser
    /// fails exceptionally.
    pub operation_timeout: Duration,
}

impl ConsumerConfiguration {
    pub fn builder(topic: impl Into<String>, subscription_name: impl Into<String>) -> ConsumerConfigurationBuilder {
        ConsumerConfigurationBuilder::new(topic, subscription_name)
    }

    /// Whether the unacked message tracker should be active at all.
    pub fn ack_timeout_enabled(&self) -> bool {
        !self.ack_timeout.is_zero()
    }
}

/// Builds and validates a [`ConsumerConfiguration`].
#[derive(Debug, Clone)]
pub struct ConsumerConfigurationBuilder {
    topic: String,
    subscription_name: String,
    subscription_type: SubscriptionType,
    subscription_initial_position: SubscriptionInitialPosition,
    receiver_queue_size: u32,
    ack_timeout: Duration,
    ack_timeout_tick: Option<Duration>,
    ack_group_time: Duration,
    read_compacted: bool,
    consumer_name: Option<String>,
    is_persistent_topic: bool,
    has_parent_consumer: bool,
    operation_timeout: Duration,
}

impl ConsumerConfigurationBuilder {
    fn new(topic: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription_name: subscription_name.into(),
            subscription_type: SubscriptionType::Exclusive,
            subscription_initial_position: SubscriptionInitialPosition::Latest,
            receiver_queue_size: 1000,
            ack_timeout: Duration::ZERO,
            ack_timeout_tick: None,
            ack_group_time: Duration::from_millis(100),
            read_compacted: false,
            consumer_name: None,
            is_persistent_topic: true,
            has_parent_consumer: false,
            operation_timeout: Duration::from_secs(30),
        }
    }

    pub fn subscription_type(mut self, v: SubscriptionType) -> Self {
        self.subscription_type = v;
        self
    }

    pub fn subscription_initial_position(mut self, v: SubscriptionInitialPosition) -> Self {
        self.subscription_initial_position = v;
        self
    }

    pub fn receiver_queue_size(mut self, v: u32) -> Self {
        self.receiver_queue_size = v;
        self
    }

    pub fn ack_timeout(mut self, v: Duration) -> Self {
        self.ack_timeout = v;
        self
    }

    /// Defaults to `ack_timeout` when left unset.
    pub fn ack_timeout_tick(mut self, v: Duration) -> Self {
        self.ack_timeout_tick = Some(v);
        self
    }

    pub fn ack_group_time(mut self, v: Duration) -> Self {
        self.ack_group_time = v;
        self
    }

    pub fn read_compacted(mut self, v: bool) -> Self {
        self.read_compacted = v;
        self
    }

    pub fn consumer_name(mut self, v: impl Into<String>) -> Self {
        self.consumer_name = Some(v.into());
        self
    }

    pub fn is_persistent_topic(mut self, v: bool) -> Self {
        self.is_persistent_topic = v;
        self
    }

    pub fn has_parent_consumer(mut self, v: bool) -> Self {
        self.has_parent_consumer = v;
        self
    }

    pub fn operation_timeout(mut self, v: Duration) -> Self {
        self.operation_timeout = v;
        self
    }

    pub fn build(self) -> Result<ConsumerConfiguration, ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.subscription_name.is_empty() {
            return Err(ConfigError::EmptySubscriptionName);
        }
        let ack_timeout_tick = self.ack_timeout_tick.unwrap_or(self.ack_timeout);
        if !self.ack_timeout.is_zero() && self.ack_timeout < ack_timeout_tick {
            return Err(ConfigError::AckTimeoutSmallerThanTick {
                ack_timeout: self.ack_timeout,
                ack_timeout_tick,
            });
        }
        Ok(ConsumerConfiguration {
            topic: self.topic,
            subscription_name: self.subscription_name,
            subscription_type: self.subscription_type,
            subscription_initial_position: self.subscription_initial_position,
            receiver_queue_size: self.receiver_queue_size,
            ack_timeout: self.ack_timeout,
            ack_timeout_tick,
            ack_group_time: self.ack_group_time,
            read_compacted: self.read_compacted,
            consumer_name: self.consumer_name,
            is_persistent_topic: self.is_persistent_topic,
            has_parent_consumer: self.has_parent_consumer,
            operation_timeout: self.operation_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_ack_timeout_for_tick() {
        let cfg = ConsumerConfiguration::builder("t", "s")
            .ack_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(cfg.ack_timeout_tick, Duration::from_secs(30));
    }

    #[test]
    fn rejects_tick_larger_than_timeout() {
        let err = ConsumerConfiguration::builder("t", "s")
            .ack_timeout(Duration::from_secs(1))
            .ack_timeout_tick(Duration::from_secs(2))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::AckTimeoutSmallerThanTick { .. }));
    }

    #[test]
    fn zero_ack_timeout_disables_tracking_regardless_of_tick() {
        let cfg = ConsumerConfiguration::builder("t", "s").build().unwrap();
        assert!(!cfg.ack_timeout_enabled());
    }

    #[test]
    fn rejects_empty_topic() {
        let err = ConsumerConfiguration::builder("", "s").build().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTopic));
    }
}
