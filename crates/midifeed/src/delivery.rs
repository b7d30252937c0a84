//! Per-subscriber delivery loop.
//!
//! Turns a [`Subscription`] into a stream of deliveries: a connect
//! acknowledgment, then records in publish order, with a heartbeat whenever
//! the queue stays idle for the keep-alive interval. Dropping the stream
//! (client gone, write failed) drops the subscription, which unsubscribes it.

use std::time::Duration;

use futures::Stream;

use crate::hub::Subscription;

/// Default idle interval before a heartbeat.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// One item to write to a subscriber's transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// Sent once, immediately on open
    Connected,
    /// A published record
    Record(T),
    /// Nothing arrived within the keep-alive interval
    Heartbeat,
}

/// Drive one subscription. Ends when the hub drops the subscriber.
pub fn deliveries<T>(
    mut subscription: Subscription<T>,
    keep_alive: Duration,
) -> impl Stream<Item = Delivery<T>>
where
    T: Send + 'static,
{
    async_stream::stream! {
        yield Delivery::Connected;
        loop {
            match tokio::time::timeout(keep_alive, subscription.recv()).await {
                Ok(Some(record)) => yield Delivery::Record(record),
                Ok(None) => break,
                Err(_) => yield Delivery::Heartbeat,
            }
        }
        tracing::debug!(subscriber = %subscription.id(), "delivery loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_connected_then_records_then_heartbeat() {
        let hub = Hub::new(8);
        let stream = deliveries(hub.subscribe(), Duration::from_secs(15));
        futures::pin_mut!(stream);

        assert_eq!(stream.next().await, Some(Delivery::Connected));

        hub.publish(1u32);
        hub.publish(2u32);
        assert_eq!(stream.next().await, Some(Delivery::Record(1)));
        assert_eq!(stream.next().await, Some(Delivery::Record(2)));

        // Paused clock auto-advances to the timeout
        assert_eq!(stream.next().await, Some(Delivery::Heartbeat));
        assert_eq!(stream.next().await, Some(Delivery::Heartbeat));

        hub.publish(3u32);
        assert_eq!(stream.next().await, Some(Delivery::Record(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ends_on_hub_shutdown() {
        let hub = Hub::new(8);
        let stream = deliveries(hub.subscribe(), DEFAULT_KEEP_ALIVE);
        futures::pin_mut!(stream);

        assert_eq!(stream.next().await, Some(Delivery::Connected));
        hub.publish(5u32);
        hub.shutdown();

        assert_eq!(stream.next().await, Some(Delivery::Record(5)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let hub: std::sync::Arc<Hub<u32>> = Hub::new(8);
        let stream = deliveries(hub.subscribe(), DEFAULT_KEEP_ALIVE);
        assert_eq!(hub.subscriber_count(), 1);

        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
