//! The Consumer Actor: a single-threaded mailbox loop that owns every piece of
//! consumer-private mutable state. Nothing outside this module ever mutates the
//! incoming queue, the waiting-receiver slot, the available-permits counter, or the
//! subscription lifecycle directly; every external request arrives as an [`ActorMessage`]
//! and every helper task reports back the same way.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::ack_tracker::AckGroupingTracker;
use crate::batch::split_batch;
use crate::compression::Decompressor;
use crate::config::ConsumerConfiguration;
use crate::connection::{AckType, BrokerConnection, OutboundCommand};
use crate::connection_handler::{ConnectionHandler, ConnectionState, Connector, HandlerEvent};
use crate::error::ConsumerError;
use crate::message::{Message, MessageId, MessageIdType, RawMessage};
use crate::unacked_tracker::UnackedMessageTracker;
use crate::util::{self, MAX_REDELIVER_UNACKNOWLEDGED};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The actor's inbox. Every public `Consumer` method sends exactly one of these and
/// awaits a single-shot reply.
pub(crate) enum ActorMessage {
    ConnectionOpened(Arc<dyn BrokerConnection>),
    ConnectionFailed(String),
    ConnectionClosed,
    MessageReceived(RawMessage),
    Receive(oneshot::Sender<Result<Message, ConsumerError>>),
    Acknowledge(MessageId, AckType, oneshot::Sender<bool>),
    RedeliverUnacknowledged(Vec<MessageId>, oneshot::Sender<Result<(), ConsumerError>>),
    /// Public `redeliver_unacknowledged_messages()` takes no ids from the caller; the
    /// actor supplies the whole currently-tracked set itself.
    RedeliverUnacknowledgedAll(oneshot::Sender<Result<(), ConsumerError>>),
    SendFlowPermits(u32),
    ReachedEndOfTopic,
    Close(oneshot::Sender<()>),
    Unsubscribe(oneshot::Sender<Result<(), ConsumerError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscribeState {
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

pub(crate) struct ConsumerActor {
    consumer_id: u64,
    partition_index: i32,
    config: ConsumerConfiguration,
    decompressor: Arc<dyn Decompressor>,
    connection_handler: ConnectionHandler,
    ack_tracker: AckGroupingTracker,
    unacked_tracker: UnackedMessageTracker,
    incoming_queue: VecDeque<Message>,
    waiting_receiver: Option<oneshot::Sender<Result<Message, ConsumerError>>>,
    available_permits: u32,
    end_of_topic: Arc<AtomicBool>,
    is_first_connect: bool,
    state: SubscribeState,
    subscribe_reply: Option<oneshot::Sender<Result<(), ConsumerError>>>,
    subscribe_deadline: std::time::Instant,
    self_tx: mpsc::UnboundedSender<ActorMessage>,
}

impl ConsumerActor {
    /// Spawns the actor task and blocks until the initial subscribe has succeeded or
    /// the configured `operation_timeout` has elapsed.
    pub(crate) async fn spawn(
        consumer_id: u64,
        partition_index: i32,
        config: ConsumerConfiguration,
        connector: Arc<dyn Connector>,
        decompressor: Arc<dyn Decompressor>,
        end_of_topic: Arc<AtomicBool>,
    ) -> Result<mpsc::UnboundedSender<ActorMessage>, ConsumerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let ack_tracker = if config.is_persistent_topic {
            AckGroupingTracker::persistent(consumer_id, config.ack_group_time)
        } else {
            AckGroupingTracker::non_persistent()
        };
        let unacked_tracker = if config.ack_timeout_enabled() {
            let on_timeout_tx = tx.clone();
            UnackedMessageTracker::start(
                config.ack_timeout,
                config.ack_timeout_tick,
                Arc::new(move |ids| {
                    let _ = on_timeout_tx.send(ActorMessage::RedeliverUnacknowledged(ids, {
                        let (reply, _) = oneshot::channel();
                        reply
                    }));
                }),
            )
        } else {
            UnackedMessageTracker::disabled()
        };

        let operation_timeout = config.operation_timeout;
        let mut actor = ConsumerActor {
            consumer_id,
            partition_index,
            config,
            decompressor,
            connection_handler: ConnectionHandler::new(connector),
            ack_tracker,
            unacked_tracker,
            incoming_queue: VecDeque::new(),
            waiting_receiver: None,
            available_permits: 0,
            end_of_topic,
            is_first_connect: true,
            state: SubscribeState::Connecting,
            subscribe_reply: Some(ready_tx),
            subscribe_deadline: std::time::Instant::now() + operation_timeout,
            self_tx: tx.clone(),
        };

        tokio::spawn(async move {
            actor.grab_connection();
            actor.run(rx).await;
        });

        match tokio::time::timeout(operation_timeout, ready_rx).await {
            Ok(Ok(result)) => result.map(|_| tx),
            Ok(Err(_)) => Err(ConsumerError::SubscribeFailed("actor terminated before subscribing".into())),
            Err(_) => Err(ConsumerError::SubscribeFailed("operation_timeout elapsed".into())),
        }
    }

    fn on_event_sender(&self) -> Arc<dyn Fn(HandlerEvent) + Send + Sync> {
        let tx = self.self_tx.clone();
        Arc::new(move |event| {
            let message = match event {
                HandlerEvent::Opened(conn) => ActorMessage::ConnectionOpened(conn),
                HandlerEvent::Closed => ActorMessage::ConnectionClosed,
                HandlerEvent::Failed(err) => ActorMessage::ConnectionFailed(err),
            };
            let _ = tx.send(message);
        })
    }

    fn grab_connection(&mut self) {
        let on_event = self.on_event_sender();
        self.connection_handler.grab_connection(on_event);
    }

    async fn run(&mut self, mut inbox: mpsc::UnboundedReceiver<ActorMessage>) {
        while let Some(message) = inbox.recv().await {
            match message {
                ActorMessage::ConnectionOpened(conn) => self.on_connection_opened(conn).await,
                ActorMessage::ConnectionFailed(err) => self.on_connection_failed(err),
                ActorMessage::ConnectionClosed => self.on_connection_closed(),
                ActorMessage::MessageReceived(raw) => self.on_message_received(raw),
                ActorMessage::Receive(reply) => self.on_receive(reply),
                ActorMessage::Acknowledge(id, ack_type, reply) => self.on_acknowledge(id, ack_type, reply).await,
                ActorMessage::RedeliverUnacknowledged(ids, reply) => self.on_redeliver_unacknowledged(ids, reply).await,
                ActorMessage::RedeliverUnacknowledgedAll(reply) => {
                    let ids = self.unacked_tracker.snapshot();
                    self.on_redeliver_unacknowledged(ids, reply).await
                }
                ActorMessage::SendFlowPermits(n) => self.on_send_flow_permits(n).await,
                ActorMessage::ReachedEndOfTopic => self.end_of_topic.store(true, Ordering::Release),
                ActorMessage::Close(reply) => {
                    self.on_close().await;
                    let _ = reply.send(());
                    break;
                }
                ActorMessage::Unsubscribe(reply) => {
                    let result = self.on_unsubscribe().await;
                    let _ = reply.send(result);
                    break;
                }
            }
        }
        self.ack_tracker.stop();
        self.unacked_tracker.stop();
        if let Some(reply) = self.waiting_receiver.take() {
            let _ = reply.send(Err(ConsumerError::AlreadyClosed));
        }
    }

    // -- connection lifecycle -------------------------------------------------

    async fn on_connection_opened(&mut self, connection: Arc<dyn BrokerConnection>) {
        connection.add_consumer(self.consumer_id);
        let request_id = next_request_id();
        let subscribe = OutboundCommand::Subscribe {
            consumer_id: self.consumer_id,
            request_id,
            topic: self.config.topic.clone(),
            subscription_name: self.config.subscription_name.clone(),
            subscription_type: self.config.subscription_type,
            initial_position: self.config.subscription_initial_position,
            read_compacted: self.config.read_compacted,
            consumer_name: self.config.consumer_name.clone(),
        };
        match connection.send_and_wait_for_reply(request_id, subscribe).await {
            Ok(()) => {
                self.connection_handler.mark_ready(connection.clone());
                self.connection_handler.reset_backoff();
                self.ack_tracker.set_connection(Some(connection));
                self.state = SubscribeState::Ready;
                if let Some(reply) = self.subscribe_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                // Open question: on the very first connect of a partitioned
                // consumer whose parent owns a durable subscription, the parent sends
                // the initial flow itself; every subsequent reconnect sends its own,
                // since the broker has forgotten the consumer's credits regardless.
                let suppress_initial_flow = self.is_first_connect && self.config.has_parent_consumer && self.config.is_persistent_topic;
                self.is_first_connect = false;
                if !suppress_initial_flow && self.config.receiver_queue_size > 0 {
                    self.send_flow(self.config.receiver_queue_size).await;
                }
                debug!(consumer_id = self.consumer_id, partition = self.partition_index, "subscribe succeeded");
            }
            Err(err) => {
                connection.remove_consumer(self.consumer_id);
                self.ack_tracker.set_connection(None);
                let retriable = ConnectionHandler::is_retriable_error(&err);
                // Only an in-flight initial subscribe is bounded by the deadline; once the
                // consumer has ever reached Ready, a retriable failure always reconnects.
                let establishing = self.subscribe_reply.is_some();
                let within_deadline = !establishing || std::time::Instant::now() < self.subscribe_deadline;
                if retriable && within_deadline {
                    let on_event = self.on_event_sender();
                    self.connection_handler.reconnect_later(on_event);
                } else {
                    self.connection_handler.mark_failed();
                    self.state = SubscribeState::Failed;
                    if let Some(reply) = self.subscribe_reply.take() {
                        let _ = reply.send(Err(ConsumerError::SubscribeFailed(err.message)));
                    }
                }
            }
        }
    }

    fn on_connection_failed(&mut self, err: String) {
        warn!(consumer_id = self.consumer_id, error = %err, "connection attempt failed");
        self.ack_tracker.set_connection(None);
        // Only the initial subscribe is bounded by `subscribe_deadline`; an established
        // consumer (subscribe_reply already taken) always keeps retrying.
        if self.subscribe_reply.is_some() && std::time::Instant::now() >= self.subscribe_deadline {
            self.connection_handler.mark_failed();
            self.state = SubscribeState::Failed;
            if let Some(reply) = self.subscribe_reply.take() {
                let _ = reply.send(Err(ConsumerError::SubscribeFailed(err)));
            }
            return;
        }
        let on_event = self.on_event_sender();
        self.connection_handler.reconnect_later(on_event);
    }

    fn on_connection_closed(&mut self) {
        self.ack_tracker.set_connection(None);
        let on_event = self.on_event_sender();
        self.connection_handler.connection_closed(on_event);
    }

    // -- application-facing operations -----------------------------------------

    fn on_receive(&mut self, reply: oneshot::Sender<Result<Message, ConsumerError>>) {
        if self.state == SubscribeState::Closed || self.state == SubscribeState::Failed {
            let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            return;
        }
        match self.incoming_queue.pop_front() {
            Some(message) => self.deliver(reply, message),
            None => {
                if let Some(stale) = self.waiting_receiver.replace(reply) {
                    let _ = stale.send(Err(ConsumerError::AlreadyClosed));
                }
            }
        }
    }

    fn deliver(&mut self, reply: oneshot::Sender<Result<Message, ConsumerError>>, message: Message) {
        self.account_for_delivery(&message.message_id);
        let _ = reply.send(Ok(message));
    }

    fn enqueue_or_deliver(&mut self, message: Message) {
        match self.waiting_receiver.take() {
            Some(reply) => self.deliver(reply, message),
            None => self.incoming_queue.push_back(message),
        }
    }

    fn account_for_delivery(&mut self, id: &MessageId) {
        if self.unacked_tracker.is_enabled() && !self.config.has_parent_consumer {
            self.unacked_tracker.add(id.clone());
        }
        self.available_permits += 1;
        self.maybe_replenish_flow();
    }

    fn maybe_replenish_flow(&mut self) {
        let threshold = (self.config.receiver_queue_size / 2).max(1);
        if self.available_permits >= threshold {
            let permits = self.available_permits;
            self.available_permits = 0;
            let _ = self.self_tx.send(ActorMessage::SendFlowPermits(permits));
        }
    }

    async fn on_send_flow_permits(&mut self, permits: u32) {
        self.send_flow(permits).await;
    }

    async fn send_flow(&self, permits: u32) {
        if permits == 0 {
            return;
        }
        let Some(connection) = self.connection_handler.connection() else {
            return;
        };
        let ok = connection
            .send(OutboundCommand::Flow {
                consumer_id: self.consumer_id,
                permits,
            })
            .await;
        if !ok {
            warn!(consumer_id = self.consumer_id, permits, "flow permits send failed, will be re-requested on reconnect");
        }
    }

    fn on_message_received(&mut self, raw: RawMessage) {
        let id = MessageId::individual(raw.ledger_id, raw.entry_id, self.partition_index, raw.topic_name.clone());

        if self.ack_tracker.is_duplicate(&id) {
            trace!(ledger_id = raw.ledger_id, entry_id = raw.entry_id, "discarding duplicate delivery");
            self.return_credits(raw.metadata.num_messages.max(0) as u32);
            return;
        }

        if raw.metadata.num_messages <= 0 {
            warn!(num_messages = raw.metadata.num_messages, "dropping frame with non-positive num_messages");
            return;
        }

        let decompressed = match self.decompressor.decompress(
            raw.metadata.compression_type,
            &raw.payload,
            raw.metadata.uncompressed_size as usize,
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "decompression failed, dropping frame");
                return;
            }
        };

        if raw.metadata.num_messages == 1 && !raw.metadata.has_num_messages_in_batch {
            let message = Message {
                message_id: id,
                metadata: raw.metadata,
                payload: decompressed,
                properties: raw.properties,
                message_key: raw.message_key,
            };
            self.enqueue_or_deliver(message);
            return;
        }

        match split_batch(raw.ledger_id, raw.entry_id, self.partition_index, &raw.topic_name, &decompressed, raw.metadata.num_messages as usize) {
            Ok(messages) => {
                for message in messages {
                    self.incoming_queue.push_back(message);
                }
                if self.waiting_receiver.is_some() {
                    if let Some(first) = self.incoming_queue.pop_front() {
                        let reply = self.waiting_receiver.take().unwrap();
                        self.deliver(reply, first);
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to split batch, dropping frame"),
        }
    }

    fn return_credits(&mut self, credits: u32) {
        self.available_permits += credits;
        self.maybe_replenish_flow();
    }

    async fn on_acknowledge(&mut self, id: MessageId, ack_type: AckType, reply: oneshot::Sender<bool>) {
        if self.connection_handler.state() != ConnectionState::Ready {
            let _ = reply.send(false);
            return;
        }
        match id.acker().cloned() {
            Some(acker) => {
                let index = id.batch_index().unwrap_or(0) as usize;
                if ack_type == AckType::Cumulative && !acker.prev_batch_cumulatively_acked() {
                    let boundary = MessageId::individual(id.ledger_id, id.entry_id.saturating_sub(1), id.partition_index, id.topic_name.clone());
                    self.ack_tracker.add_acknowledgment(boundary, AckType::Cumulative);
                    acker.set_prev_batch_cumulatively_acked(true);
                }
                let fully_acked = match ack_type {
                    AckType::Individual => {
                        self.unacked_tracker.remove(&id);
                        acker.ack_individual(index)
                    }
                    AckType::Cumulative => {
                        // `ack_group` clears member bits 0..=index; the unacked tracker must
                        // drop every one of those member ids too, not just `id` itself, or
                        // the already-acked ones linger until they spuriously time out.
                        for batch_index in 0..=index {
                            let member = MessageId {
                                id_type: MessageIdType::Cumulative { batch_index: batch_index as u32, acker: acker.clone() },
                                ..id.clone()
                            };
                            self.unacked_tracker.remove(&member);
                        }
                        acker.ack_group(index)
                    }
                };
                if fully_acked {
                    let whole_entry = MessageId::individual(id.ledger_id, id.entry_id, id.partition_index, id.topic_name.clone());
                    self.ack_tracker.add_acknowledgment(whole_entry, AckType::Cumulative);
                }
            }
            None => {
                self.unacked_tracker.remove(&id);
                self.ack_tracker.add_acknowledgment(id, ack_type);
            }
        }
        let _ = reply.send(true);
    }

    async fn on_redeliver_unacknowledged(&mut self, ids: Vec<MessageId>, reply: oneshot::Sender<Result<(), ConsumerError>>) {
        if !self.config.subscription_type.supports_selective_redelivery() {
            self.on_redeliver_all(reply).await;
            return;
        }
        let Some(connection) = self.connection_handler.connection() else {
            let _ = reply.send(Err(ConsumerError::NotConnected));
            return;
        };

        let mut purged = 0u32;
        self.incoming_queue.retain(|message| {
            let still_present = ids.contains(&message.message_id);
            if still_present {
                purged += 1;
            }
            !still_present
        });
        self.return_credits(purged);

        let mut send_failed = false;
        for chunk in util::chunk(&ids, MAX_REDELIVER_UNACKNOWLEDGED) {
            let ok = connection
                .send(OutboundCommand::RedeliverUnacknowledged {
                    consumer_id: self.consumer_id,
                    message_ids: chunk,
                })
                .await;
            if !ok {
                warn!(consumer_id = self.consumer_id, "redeliver-unacknowledged send failed");
                send_failed = true;
            }
        }
        let result = if send_failed {
            Err(ConsumerError::ConnectionFailedOnSend("redeliver_unacknowledged"))
        } else {
            Ok(())
        };
        let _ = reply.send(result);
    }

    async fn on_redeliver_all(&mut self, reply: oneshot::Sender<Result<(), ConsumerError>>) {
        let Some(connection) = self.connection_handler.connection() else {
            let _ = reply.send(Err(ConsumerError::NotConnected));
            return;
        };
        let request_id = next_request_id();
        let result = connection
            .send_and_wait_for_reply(request_id, OutboundCommand::RedeliverAll {
                consumer_id: self.consumer_id,
                request_id,
            })
            .await;
        let outcome = match result {
            Ok(()) => {
                let purged = self.incoming_queue.len() as u32;
                self.incoming_queue.clear();
                self.unacked_tracker.clear();
                self.return_credits(purged);
                Ok(())
            }
            Err(err) if err.retriable => {
                warn!(consumer_id = self.consumer_id, "redeliver-all send failed");
                Err(ConsumerError::ConnectionFailedOnSend("redeliver_all"))
            }
            Err(err) => {
                warn!(consumer_id = self.consumer_id, "redeliver-all rejected");
                Err(ConsumerError::BrokerRejected(err.message))
            }
        };
        let _ = reply.send(outcome);
    }

    async fn on_close(&mut self) {
        if self.state == SubscribeState::Closed || self.state == SubscribeState::Closing {
            return;
        }
        if self.state == SubscribeState::Ready {
            self.state = SubscribeState::Closing;
            self.connection_handler.mark_closing();
            if let Some(connection) = self.connection_handler.connection() {
                let request_id = next_request_id();
                let _ = connection
                    .send_and_wait_for_reply(request_id, OutboundCommand::CloseConsumer {
                        consumer_id: self.consumer_id,
                        request_id,
                    })
                    .await;
                connection.remove_consumer(self.consumer_id);
            }
        }
        self.connection_handler.mark_closed();
        self.state = SubscribeState::Closed;
        info!(consumer_id = self.consumer_id, "consumer closed");
    }

    async fn on_unsubscribe(&mut self) -> Result<(), ConsumerError> {
        if self.state == SubscribeState::Closed || self.state == SubscribeState::Failed {
            return Err(ConsumerError::AlreadyClosed);
        }
        let Some(connection) = self.connection_handler.connection() else {
            return Err(ConsumerError::NotConnected);
        };
        let request_id = next_request_id();
        let result = connection
            .send_and_wait_for_reply(request_id, OutboundCommand::UnsubscribeConsumer {
                consumer_id: self.consumer_id,
                request_id,
            })
            .await;
        connection.remove_consumer(self.consumer_id);
        self.connection_handler.mark_closed();
        self.state = SubscribeState::Closed;
        result.map_err(|err| {
            if err.retriable {
                ConsumerError::ConnectionFailedOnSend("unsubscribe")
            } else {
                ConsumerError::BrokerRejected(err.message)
            }
        })
    }
}
