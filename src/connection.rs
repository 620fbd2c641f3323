//! The connection abstraction consumed by the consumer actor.
//!
//! Everything below is an external collaborator: the actual
//! binary wire codec, transport I/O, and broker lookup are assumed provided by a layer
//! above this crate. `BrokerConnection` is the thin seam between them: the actor depends
//! on it for sending frames and waiting on replies without knowing about sockets, TLS,
//! or auth.

use async_trait::async_trait;

use crate::message::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    Individual,
    Cumulative,
}

/// A command frame the consumer sends outbound. Acks and redelivers carry only the
/// identifying triple of each message id; the batch index (if any) is carried alongside
/// since the broker acks at that granularity for cumulative members.
#[derive(Debug, Clone)]
pub enum OutboundCommand {
    Subscribe {
        consumer_id: u64,
        request_id: u64,
        topic: String,
        subscription_name: String,
        subscription_type: crate::config::SubscriptionType,
        initial_position: crate::config::SubscriptionInitialPosition,
        read_compacted: bool,
        consumer_name: Option<String>,
    },
    Flow {
        consumer_id: u64,
        permits: u32,
    },
    Ack {
        consumer_id: u64,
        message_ids: Vec<MessageId>,
        ack_type: AckType,
    },
    RedeliverUnacknowledged {
        consumer_id: u64,
        message_ids: Vec<MessageId>,
    },
    RedeliverAll {
        consumer_id: u64,
        request_id: u64,
    },
    CloseConsumer {
        consumer_id: u64,
        request_id: u64,
    },
    UnsubscribeConsumer {
        consumer_id: u64,
        request_id: u64,
    },
}

/// A broker-reported failure, distinguishing retriable transport-level conditions from
/// protocol-fatal rejections.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BrokerError {
    pub message: String,
    pub retriable: bool,
}

/// The shared, thread-safe connection interface a consumer actor sends frames over.
///
/// A single `BrokerConnection` is shared by many consumers and producers;
/// implementations must be safe to clone and call concurrently.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Best-effort send of a fire-and-forget command (flow, ack, selective redeliver).
    /// Returns `false` if the command could not be handed to the transport at all.
    async fn send(&self, command: OutboundCommand) -> bool;

    /// Sends a request/response command and waits for its reply.
    async fn send_and_wait_for_reply(&self, request_id: u64, command: OutboundCommand) -> Result<(), BrokerError>;

    /// Registers this consumer's inbox on the connection so the transport layer can
    /// route incoming message frames and broker-initiated events to it.
    fn add_consumer(&self, consumer_id: u64);

    /// Deregisters a previously-registered consumer.
    fn remove_consumer(&self, consumer_id: u64);
}
