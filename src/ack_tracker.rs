//! Batches acknowledgments over a time window and deduplicates recently-acked ids.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{AckType, BrokerConnection, OutboundCommand};
use crate::message::MessageId;

/// Above this many pending individual acks, a flush is triggered immediately instead of
/// waiting for the window to elapse.
const MAX_PENDING_BEFORE_FLUSH: usize = 1000;

/// Size of the recent-ack dedup window.
const RECENT_ACK_CAPACITY: usize = 10_000;

struct RecentAcks {
    order: VecDeque<MessageId>,
    set: HashSet<MessageId>,
}

impl RecentAcks {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    fn insert(&mut self, id: MessageId) {
        if self.set.insert(id.clone()) {
            self.order.push_back(id);
            while self.order.len() > RECENT_ACK_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.set.remove(&oldest);
                }
            }
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }
}

struct Pending {
    individual: Vec<MessageId>,
    cumulative: Option<MessageId>,
}

impl Pending {
    fn new() -> Self {
        Self {
            individual: Vec::new(),
            cumulative: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.individual.is_empty() && self.cumulative.is_none()
    }

    fn take(&mut self) -> Pending {
        std::mem::replace(self, Pending::new())
    }
}

struct PersistentInner {
    consumer_id: u64,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    pending: Mutex<Pending>,
    recent: Mutex<RecentAcks>,
}

impl PersistentInner {
    async fn flush(self: &Arc<Self>) {
        let pending = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            pending.take()
        };
        let connection = self.connection.lock().clone();
        let Some(connection) = connection else {
            warn!("ack flush skipped: not connected, acks remain pending");
            self.requeue(pending);
            return;
        };

        if let Some(cumulative) = pending.cumulative.clone() {
            let ok = connection
                .send(OutboundCommand::Ack {
                    consumer_id: self.consumer_id,
                    message_ids: vec![cumulative.clone()],
                    ack_type: AckType::Cumulative,
                })
                .await;
            if !ok {
                warn!("cumulative ack send failed, will retry next flush");
                self.pending.lock().cumulative = Some(cumulative);
            }
        }
        if !pending.individual.is_empty() {
            let ok = connection
                .send(OutboundCommand::Ack {
                    consumer_id: self.consumer_id,
                    message_ids: pending.individual.clone(),
                    ack_type: AckType::Individual,
                })
                .await;
            if !ok {
                warn!(count = pending.individual.len(), "individual ack send failed, will retry next flush");
                self.pending.lock().individual.extend(pending.individual);
            } else {
                debug!(count = pending.individual.len(), "flushed individual acks");
            }
        }
    }

    fn requeue(&self, pending: Pending) {
        let mut current = self.pending.lock();
        if current.cumulative.is_none() {
            current.cumulative = pending.cumulative;
        }
        current.individual.extend(pending.individual);
    }
}

enum Variant {
    /// Non-persistent subscriptions have no cursor to advance; acks are a no-op.
    NonPersistent,
    Persistent {
        inner: Arc<PersistentInner>,
        ticker: tokio::task::JoinHandle<()>,
    },
}

/// Groups acknowledgments for a single consumer and flushes them on a timer.
pub struct AckGroupingTracker {
    variant: Variant,
}

impl AckGroupingTracker {
    pub fn non_persistent() -> Self {
        Self {
            variant: Variant::NonPersistent,
        }
    }

    pub fn persistent(consumer_id: u64, ack_group_time: Duration) -> Self {
        let inner = Arc::new(PersistentInner {
            consumer_id,
            connection: Mutex::new(None),
            pending: Mutex::new(Pending::new()),
            recent: Mutex::new(RecentAcks::new()),
        });
        let ticking = inner.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ack_group_time.max(Duration::from_millis(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                ticking.flush().await;
            }
        });
        Self {
            variant: Variant::Persistent { inner, ticker },
        }
    }

    pub fn set_connection(&self, connection: Option<Arc<dyn BrokerConnection>>) {
        if let Variant::Persistent { inner, .. } = &self.variant {
            *inner.connection.lock() = connection;
        }
    }

    /// Records an ack, flushing immediately if the pending buffer has overflowed.
    pub fn add_acknowledgment(&self, id: MessageId, ack_type: AckType) {
        let Variant::Persistent { inner, .. } = &self.variant else {
            return;
        };
        inner.recent.lock().insert(id.clone());
        let should_flush_now = {
            let mut pending = inner.pending.lock();
            match ack_type {
                AckType::Individual => pending.individual.push(id),
                AckType::Cumulative => pending.cumulative = Some(id),
            }
            pending.individual.len() >= MAX_PENDING_BEFORE_FLUSH
        };
        if should_flush_now {
            let inner = inner.clone();
            tokio::spawn(async move { inner.flush().await });
        }
    }

    /// Returns true iff `id` was acked recently enough that a redelivery for it should
    /// be suppressed.
    pub fn is_duplicate(&self, id: &MessageId) -> bool {
        match &self.variant {
            Variant::NonPersistent => false,
            Variant::Persistent { inner, .. } => inner.recent.lock().contains(id),
        }
    }

    /// Stops the flush ticker. Called once on consumer close; any still-pending acks
    /// are simply dropped, matching the "best-effort ack" contract.
    pub fn stop(&self) {
        if let Variant::Persistent { ticker, .. } = &self.variant {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BrokerError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingConnection {
        sends: Arc<Mutex<Vec<OutboundCommand>>>,
        accept: bool,
    }

    #[async_trait::async_trait]
    impl BrokerConnection for RecordingConnection {
        async fn send(&self, command: OutboundCommand) -> bool {
            if self.accept {
                self.sends.lock().push(command);
            }
            self.accept
        }
        async fn send_and_wait_for_reply(&self, _request_id: u64, _command: OutboundCommand) -> Result<(), BrokerError> {
            Ok(())
        }
        fn add_consumer(&self, _consumer_id: u64) {}
        fn remove_consumer(&self, _consumer_id: u64) {}
    }

    #[test]
    fn non_persistent_never_reports_duplicates_or_sends() {
        let tracker = AckGroupingTracker::non_persistent();
        let id = MessageId::individual(1, 1, 0, "t");
        tracker.add_acknowledgment(id.clone(), AckType::Individual);
        assert!(!tracker.is_duplicate(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_window_batches_individual_acks_into_one_frame() {
        let sends = Arc::new(Mutex::new(Vec::new()));
        let connection: Arc<dyn BrokerConnection> = Arc::new(RecordingConnection {
            sends: sends.clone(),
            accept: true,
        });
        let tracker = AckGroupingTracker::persistent(7, Duration::from_millis(100));
        tracker.set_connection(Some(connection));

        let ids: Vec<_> = (0..5).map(|i| MessageId::individual(1, i, 0, "t")).collect();
        for id in &ids {
            tracker.add_acknowledgment(id.clone(), AckType::Individual);
            assert!(tracker.is_duplicate(id));
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        let sent = sends.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            OutboundCommand::Ack { message_ids, ack_type, .. } => {
                assert_eq!(*ack_type, AckType::Individual);
                assert_eq!(message_ids.len(), 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_triggers_immediate_flush_without_waiting_for_window() {
        let sends = Arc::new(Mutex::new(Vec::new()));
        let connection: Arc<dyn BrokerConnection> = Arc::new(RecordingConnection {
            sends: sends.clone(),
            accept: true,
        });
        let tracker = AckGroupingTracker::persistent(1, Duration::from_secs(3600));
        tracker.set_connection(Some(connection));

        for i in 0..MAX_PENDING_BEFORE_FLUSH as u64 {
            tracker.add_acknowledgment(MessageId::individual(1, i, 0, "t"), AckType::Individual);
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!sends.lock().is_empty(), "overflow flush should not wait for the window ticker");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_keeps_ack_pending_for_next_flush() {
        let attempts = Arc::new(AtomicUsize::new(0));
        struct Flaky {
            attempts: Arc<AtomicUsize>,
        }
        #[async_trait::async_trait]
        impl BrokerConnection for Flaky {
            async fn send(&self, _command: OutboundCommand) -> bool {
                self.attempts.fetch_add(1, Ordering::SeqCst) > 0
            }
            async fn send_and_wait_for_reply(&self, _request_id: u64, _command: OutboundCommand) -> Result<(), BrokerError> {
                Ok(())
            }
            fn add_consumer(&self, _consumer_id: u64) {}
            fn remove_consumer(&self, _consumer_id: u64) {}
        }
        let connection: Arc<dyn BrokerConnection> = Arc::new(Flaky { attempts: attempts.clone() });
        let tracker = AckGroupingTracker::persistent(1, Duration::from_millis(50));
        tracker.set_connection(Some(connection));
        tracker.add_acknowledgment(MessageId::individual(1, 1, 0, "t"), AckType::Individual);

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "first flush attempt should have failed");

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "ack must still be pending for the second flush");
    }
}
