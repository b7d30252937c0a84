//! Fan-out of one record stream to many subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: the
//! subscriber set is snapshotted under the lock, then every queue gets a
//! non-blocking send outside it. A full queue drops that record for that
//! subscriber only, leaving a gap in its stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use uuid::Uuid;

/// Identifies one registered subscriber.
pub type SubscriberId = Uuid;

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Queues that accepted the record
    pub delivered: usize,
    /// Queues that were full
    pub dropped: usize,
}

/// Multi-subscriber distribution hub.
///
/// Constructed once per server and shared as `Arc<Hub<T>>`.
pub struct Hub<T> {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<T>>>,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl<T> Hub<T> {
    /// Create a hub whose subscribers each buffer up to `capacity` records.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Per-subscriber queue depth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new subscriber.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        debug!(subscriber = %id, subscribers = count, "subscriber added");

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            debug!(subscriber = %id, subscribers = count, "subscriber removed");
        }
        removed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Records published since the hub was created.
    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Per-subscriber drops caused by full queues, summed over all subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop every subscriber. Their queues drain and then end.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        debug!(subscribers = drained.len(), "hub shut down");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<T>>> {
        // Nothing in the critical sections can leave the map inconsistent
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Hub<T> {
    /// Offer a record to every current subscriber without blocking.
    pub fn publish(&self, record: T) -> PublishStats {
        let snapshot: Vec<(SubscriberId, mpsc::Sender<T>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        self.published.fetch_add(1, Ordering::Relaxed);

        let mut stats = PublishStats::default();
        for (id, tx) in snapshot {
            match tx.try_send(record.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    trace!(subscriber = %id, "queue full, record dropped");
                }
                // Receiver went away between snapshot and send
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if stats.dropped > 0 {
            self.dropped.fetch_add(stats.dropped as u64, Ordering::Relaxed);
        }
        stats
    }
}

/// Receiving end of one subscriber. Unsubscribes itself when dropped.
pub struct Subscription<T> {
    id: SubscriberId,
    rx: mpsc::Receiver<T>,
    hub: Weak<Hub<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next record. `None` once the hub dropped this subscriber
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a queued record if there is one.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of records waiting in this subscriber's queue.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let stats = hub.publish(1);
        assert_eq!(stats, PublishStats::default());
        assert_eq!(hub.published_total(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let sub = hub.subscribe();
        let id = sub.id();

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.subscriber_count(), 0);

        // Dropping after an explicit unsubscribe is also fine
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let a = hub.subscribe();
        let _b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_receiver_drains_then_ends() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let mut sub = hub.subscribe();
        hub.publish(7);
        hub.unsubscribe(sub.id());
        hub.publish(8);

        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let mut sub = hub.subscribe();
        hub.publish(1);
        hub.shutdown();

        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscription_outlives_hub() {
        let hub: Arc<Hub<u32>> = Hub::new(4);
        let mut sub = hub.subscribe();
        drop(hub);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let hub: Arc<Hub<u32>> = Hub::new(0);
        assert_eq!(hub.capacity(), 1);
    }
}
