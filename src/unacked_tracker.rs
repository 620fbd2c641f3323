//! A time-wheel of in-flight message ids that triggers redelivery on timeout.
//!
//! The tracker owns its bucket ring outright; its ticker task mutates that ring
//! directly and never touches the consumer actor's private fields. Timed-out
//! ids are handed to the actor only through the `on_timeout` callback, which the actor
//! wires up to enqueue a redeliver request on its own inbox.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::message::MessageId;

struct TrackerState {
    buckets: Mutex<VecDeque<HashSet<MessageId>>>,
}

impl TrackerState {
    fn new(num_buckets: usize) -> Self {
        let mut buckets = VecDeque::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push_back(HashSet::new());
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    fn add(&self, id: MessageId) {
        let mut buckets = self.buckets.lock();
        if let Some(head) = buckets.back_mut() {
            head.insert(id);
        }
    }

    fn remove(&self, id: &MessageId) -> bool {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            if bucket.remove(id) {
                return true;
            }
        }
        false
    }

    fn clear(&self) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            bucket.clear();
        }
    }

    fn snapshot(&self) -> Vec<MessageId> {
        let buckets = self.buckets.lock();
        buckets.iter().flatten().cloned().collect()
    }

    /// Evicts the oldest bucket and opens a fresh one at the head. Returns the evicted
    /// bucket's contents.
    fn advance(&self) -> Vec<MessageId> {
        let mut buckets = self.buckets.lock();
        let evicted = buckets.pop_front().unwrap_or_default();
        buckets.push_back(HashSet::new());
        evicted.into_iter().collect()
    }
}

/// `Disabled` is used whenever `ack_timeout == 0`; every operation is then a
/// no-op instead of branching on an `Option` at every call site.
pub enum UnackedMessageTracker {
    Disabled,
    Enabled {
        state: Arc<TrackerState>,
        ticker: tokio::task::JoinHandle<()>,
    },
}

impl UnackedMessageTracker {
    pub fn disabled() -> Self {
        UnackedMessageTracker::Disabled
    }

    /// Starts a ticker that fires every `tick` and flushes the oldest bucket to
    /// `on_timeout`. `ack_timeout` sizes the ring so that a message added right after a
    /// tick still gets roughly `ack_timeout` before its bucket is evicted.
    pub fn start(ack_timeout: Duration, tick: Duration, on_timeout: Arc<dyn Fn(Vec<MessageId>) + Send + Sync>) -> Self {
        let num_buckets = ((ack_timeout.as_millis() / tick.as_millis().max(1)) as usize).max(1) + 1;
        let state = Arc::new(TrackerState::new(num_buckets));
        let ticking_state = state.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = ticking_state.advance();
                if !evicted.is_empty() {
                    trace!(count = evicted.len(), "unacked bucket evicted");
                    on_timeout(evicted);
                }
            }
        });
        UnackedMessageTracker::Enabled { state, ticker }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, UnackedMessageTracker::Enabled { .. })
    }

    pub fn add(&self, id: MessageId) {
        if let UnackedMessageTracker::Enabled { state, .. } = self {
            state.add(id);
        }
    }

    pub fn remove(&self, id: &MessageId) -> bool {
        match self {
            UnackedMessageTracker::Enabled { state, .. } => state.remove(id),
            UnackedMessageTracker::Disabled => false,
        }
    }

    pub fn clear(&self) {
        if let UnackedMessageTracker::Enabled { state, .. } = self {
            state.clear();
        }
    }

    /// Returns every currently-tracked id.
    pub fn snapshot(&self) -> Vec<MessageId> {
        match self {
            UnackedMessageTracker::Enabled { state, .. } => state.snapshot(),
            UnackedMessageTracker::Disabled => Vec::new(),
        }
    }

    /// Stops the ticker task. Called once on consumer close.
    pub fn stop(&self) {
        if let UnackedMessageTracker::Enabled { ticker, .. } = self {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disabled_tracker_never_tracks_anything() {
        let tracker = UnackedMessageTracker::disabled();
        tracker.add(MessageId::individual(1, 1, 0, "t"));
        assert!(!tracker.remove(&MessageId::individual(1, 1, 0, "t")));
        assert!(!tracker.is_enabled());
    }

    #[test]
    fn remove_searches_every_bucket() {
        let state = TrackerState::new(3);
        state.add(MessageId::individual(1, 1, 0, "t"));
        state.advance();
        state.advance();
        assert!(state.remove(&MessageId::individual(1, 1, 0, "t")));
    }

    #[test]
    fn clear_empties_every_bucket() {
        let state = TrackerState::new(2);
        state.add(MessageId::individual(1, 1, 0, "t"));
        state.advance();
        state.add(MessageId::individual(2, 2, 0, "t"));
        state.clear();
        assert!(!state.remove(&MessageId::individual(1, 1, 0, "t")));
        assert!(!state.remove(&MessageId::individual(2, 2, 0, "t")));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_evicts_and_fires_timeout_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let tracker = UnackedMessageTracker::start(
            Duration::from_millis(500),
            Duration::from_millis(500),
            Arc::new(move |ids| {
                fired_clone.fetch_add(ids.len(), Ordering::SeqCst);
            }),
        );
        tracker.add(MessageId::individual(1, 1, 0, "t"));
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
