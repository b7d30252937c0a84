//! Hub fan-out and backpressure behavior.

use std::sync::Arc;
use std::time::Duration;

use midifeed::{Hub, PublishStats};

#[tokio::test]
async fn test_every_subscriber_sees_publish_order() {
    let hub: Arc<Hub<u32>> = Hub::new(64);
    let mut subs: Vec<_> = (0..5).map(|_| hub.subscribe()).collect();

    for i in 0..20 {
        let stats = hub.publish(i);
        assert_eq!(stats, PublishStats { delivered: 5, dropped: 0 });
    }

    for sub in subs.iter_mut() {
        let mut seen = Vec::new();
        while let Some(v) = sub.try_recv() {
            seen.push(v);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_stalled_subscriber_does_not_block_others() {
    const CAPACITY: usize = 8;
    let hub: Arc<Hub<usize>> = Hub::new(CAPACITY);
    let mut stalled = hub.subscribe();
    let mut draining = hub.subscribe();

    let mut drained = Vec::new();
    for i in 0..CAPACITY + 5 {
        hub.publish(i);
        while let Some(v) = draining.try_recv() {
            drained.push(v);
        }
    }

    assert_eq!(drained, (0..CAPACITY + 5).collect::<Vec<_>>());
    assert_eq!(hub.dropped_total(), 5);

    let mut kept = Vec::new();
    while let Some(v) = stalled.try_recv() {
        kept.push(v);
    }
    assert!(kept.len() <= CAPACITY);
    // Gaps only at the tail: the oldest records were kept
    assert_eq!(kept, (0..CAPACITY).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_late_subscriber_sees_only_later_records() {
    let hub: Arc<Hub<u32>> = Hub::new(8);
    hub.publish(1);
    let mut sub = hub.subscribe();
    hub.publish(2);
    assert_eq!(sub.try_recv(), Some(2));
    assert_eq!(sub.try_recv(), None);
}

#[tokio::test]
async fn test_concurrent_subscribe_and_publish() {
    let hub: Arc<Hub<u64>> = Hub::new(1024);

    let publisher = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            for i in 0..500u64 {
                hub.publish(i);
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let mut sub = hub.subscribe();
        readers.push(tokio::spawn(async move {
            let mut last = None;
            while let Ok(Some(v)) = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
                if let Some(prev) = last {
                    assert!(v > prev, "out of order: {} after {}", v, prev);
                }
                last = Some(v);
            }
        }));
    }

    publisher.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(hub.published_total(), 500);
}
