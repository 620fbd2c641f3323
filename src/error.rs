use std::time::Duration;

/// Errors surfaced by the consumer's public API.
///
/// Transient connection failures are handled internally by the
/// [`crate::connection_handler::ConnectionHandler`] and never reach the caller as an error;
/// only failures that the application must react to (a closed consumer, a rejected
/// subscribe, a send that could not be queued) are represented here.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The consumer has already transitioned to `Closed` or `Failed`; the operation
    /// was rejected synchronously without talking to the broker.
    #[error("consumer is already closed")]
    AlreadyClosed,

    /// The operation requires a `Ready` connection and none is currently established.
    #[error("consumer is not connected")]
    NotConnected,

    /// A mid-flight user operation could not be handed to the transport at all (the
    /// underlying send failed or the broker connection was dropped before replying).
    /// The caller should treat this the same as a transient connection failure:
    /// retrying after the consumer reconnects is expected to succeed.
    #[error("failed to send {0}")]
    ConnectionFailedOnSend(&'static str),

    /// The initial subscribe did not succeed within the configured operation timeout.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The broker rejected the request with a non-retriable error.
    #[error("broker rejected request: {0}")]
    BrokerRejected(String),

    /// Decompression of a received payload failed.
    #[error("failed to decompress payload: {0}")]
    Decompression(String),

    /// A batched frame's payload did not contain the number of well-formed
    /// sub-message tuples its metadata promised.
    #[error("failed to split batch: {0}")]
    BatchDecode(String),
}

/// Errors raised while validating a [`crate::config::ConsumerConfiguration`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ack_timeout must be zero or >= ack_timeout_tick (ack_timeout={ack_timeout:?}, ack_timeout_tick={ack_timeout_tick:?})")]
    AckTimeoutSmallerThanTick {
        ack_timeout: Duration,
        ack_timeout_tick: Duration,
    },

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("subscription_name must not be empty")]
    EmptySubscriptionName,
}
