//! Change feed: fan-out of written paths to every subscription.
//!
//! One broadcast channel per store. Each write publishes the list of paths it
//! touched; subscribers filter by overlap with their own path and re-read.
//!
//! ```text
//! write ──► publish(["world/o/w/users/s1/data/5,10"])
//!               │
//!               ├──► sub "world/o/w/users"  (overlaps → re-read, emit)
//!               ├──► sub "world/o/w/data"   (no overlap → ignore)
//!               └──► sub "world/o/w"        (overlaps → re-read, emit)
//! ```
//!
//! A receiver that falls more than `capacity` batches behind gets `Lagged`;
//! subscribers treat that as "something changed" and re-read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Batch of paths touched by one write.
pub type ChangeBatch = Arc<Vec<String>>;

/// Snapshot of feed counters.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub batches_published: u64,
    pub lagged_receivers: u64,
    pub active_receivers: usize,
}

/// Lock-free counters.
#[derive(Default)]
struct AtomicFeedStats {
    batches_published: AtomicU64,
    lagged_receivers: AtomicU64,
}

/// Broadcast of change batches for one store.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeBatch>,
    capacity: usize,
    stats: Arc<AtomicFeedStats>,
}

impl ChangeFeed {
    /// `capacity` batches are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicFeedStats::default()),
        }
    }

    /// Publish a batch. Returns the number of receivers reached.
    pub fn publish(&self, paths: Vec<String>) -> usize {
        if paths.is_empty() {
            return 0;
        }
        self.stats.batches_published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Arc::new(paths)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }

    /// Count a receiver falling behind.
    pub fn record_lag(&self, skipped: u64) {
        log::warn!("Change feed receiver lagged by {skipped} batches");
        self.stats.lagged_receivers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            batches_published: self.stats.batches_published.load(Ordering::Relaxed),
            lagged_receivers: self.stats.lagged_receivers.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out() {
        let feed = ChangeFeed::new(16);
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        let reached = feed.publish(vec!["a/b".into()]);
        assert_eq!(reached, 2);
        assert_eq!(*rx1.recv().await.unwrap(), vec!["a/b".to_string()]);
        assert_eq!(*rx2.recv().await.unwrap(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_batch_not_published() {
        let feed = ChangeFeed::new(16);
        let _rx = feed.subscribe();
        assert_eq!(feed.publish(Vec::new()), 0);
        assert_eq!(feed.stats().batches_published, 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let feed = ChangeFeed::new(2);
        let mut rx = feed.subscribe();
        for i in 0..5 {
            feed.publish(vec![format!("p{i}")]);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => feed.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = feed.stats();
        assert_eq!(stats.batches_published, 5);
        assert_eq!(stats.lagged_receivers, 1);
        assert_eq!(stats.active_receivers, 1);
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(ChangeFeed::new(0).capacity(), 1);
        assert_eq!(ChangeFeed::default().capacity(), 1024);
    }
}
