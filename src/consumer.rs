//! The public handle applications hold: a thin, cloneable-free façade over the
//! Consumer Actor's inbox.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::actor::{ActorMessage, ConsumerActor};
use crate::compression::{Decompressor, StandardDecompressor};
use crate::config::ConsumerConfiguration;
use crate::connection::AckType;
use crate::connection_handler::Connector;
use crate::error::ConsumerError;
use crate::message::{Message, MessageId, RawMessage};

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// A client-side consumer bound to a single partition of a topic.
///
/// `Consumer::connect` is the static initialiser described in the data model: it does
/// not return until the first subscribe response has been received (or the configured
/// `operation_timeout` elapses).
pub struct Consumer {
    tx: mpsc::UnboundedSender<ActorMessage>,
    end_of_topic: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Consumer {
    /// Establishes a new partition consumer against `connector`, decoding batches and
    /// compressed payloads with `decompressor`.
    pub async fn connect(partition_index: i32, config: ConsumerConfiguration, connector: Arc<dyn Connector>) -> Result<Self, ConsumerError> {
        Self::connect_with_decompressor(partition_index, config, connector, Arc::new(StandardDecompressor)).await
    }

    pub async fn connect_with_decompressor(
        partition_index: i32,
        config: ConsumerConfiguration,
        connector: Arc<dyn Connector>,
        decompressor: Arc<dyn Decompressor>,
    ) -> Result<Self, ConsumerError> {
        let consumer_id = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);
        let end_of_topic = Arc::new(AtomicBool::new(false));
        let tx = ConsumerActor::spawn(consumer_id, partition_index, config, connector, decompressor, end_of_topic.clone()).await?;
        Ok(Self { tx, end_of_topic, closed: AtomicBool::new(false) })
    }

    /// Waits for the next message, in broker delivery order.
    pub async fn receive(&self) -> Result<Message, ConsumerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::Receive(reply_tx))?;
        reply_rx.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    /// Acknowledges a single message. Returns `false` (never an error) if the
    /// connection is not currently `Ready`; the broker will simply redeliver.
    pub async fn acknowledge(&self, message_id: MessageId) -> Result<bool, ConsumerError> {
        self.acknowledge_with_type(message_id, AckType::Individual).await
    }

    /// Acknowledges a message and everything the subscription cursor has not yet
    /// passed up to and including it.
    pub async fn acknowledge_cumulative(&self, message_id: MessageId) -> Result<bool, ConsumerError> {
        self.acknowledge_with_type(message_id, AckType::Cumulative).await
    }

    async fn acknowledge_with_type(&self, message_id: MessageId, ack_type: AckType) -> Result<bool, ConsumerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::Acknowledge(message_id, ack_type, reply_tx))?;
        reply_rx.await.map_err(|_| ConsumerError::AlreadyClosed)
    }

    /// Asks the broker to redeliver every currently-unacknowledged message this
    /// consumer has tracked. On Exclusive/Failover subscriptions this always
    /// redelivers the whole set; on Shared/KeyShared it redelivers selectively.
    pub async fn redeliver_unacknowledged_messages(&self) -> Result<(), ConsumerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::RedeliverUnacknowledgedAll(reply_tx))?;
        reply_rx.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    /// Closes the consumer. Idempotent: the actor task exits after the first close, so
    /// later calls are answered locally rather than re-sent to a channel with no
    /// receiver left.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.send(ActorMessage::Close(reply_tx)).is_err() {
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }

    /// Unsubscribes and closes the consumer. Unlike `close`, a repeat call reports
    /// `AlreadyClosed` rather than swallowing it.
    pub async fn unsubscribe(&self) -> Result<(), ConsumerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::Unsubscribe(reply_tx))?;
        reply_rx.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    /// Whether the broker has reported end-of-topic. Not an error; does not stop the
    /// consumer.
    pub fn has_reached_end_of_topic(&self) -> bool {
        self.end_of_topic.load(Ordering::Acquire)
    }

    /// Hands a raw wire frame to the consumer. This is the connection's read loop's
    /// entry point for delivering incoming message frames; the binary wire codec that
    /// produces a `RawMessage` from bytes on the socket is out of scope for this crate.
    pub fn deliver_raw_message(&self, raw: RawMessage) -> Result<(), ConsumerError> {
        self.send(ActorMessage::MessageReceived(raw))
    }

    /// Notifies the consumer that the broker reported end-of-topic for this partition.
    pub fn notify_reached_end_of_topic(&self) -> Result<(), ConsumerError> {
        self.send(ActorMessage::ReachedEndOfTopic)
    }

    fn send(&self, message: ActorMessage) -> Result<(), ConsumerError> {
        self.tx.send(message).map_err(|_| {
            warn!("consumer actor is no longer running");
            ConsumerError::AlreadyClosed
        })
    }
}
