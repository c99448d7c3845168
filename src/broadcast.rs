//! In-process broadcast bus for same-host fan-out.
//!
//! Plays the role a browser's `BroadcastChannel` plays for tabs: providers
//! in the same process that share a channel name converge on document and
//! awareness state without a server round-trip. Built on tokio broadcast
//! channels for O(1) send to all subscribers.
//!
//! Frames carry an opaque origin token so a publisher can recognize (and
//! skip) its own traffic when it comes back around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;

/// Messages buffered per subscriber before lagging ones drop frames.
const CHANNEL_CAPACITY: usize = 256;

/// One frame on the bus.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub data: Arc<Vec<u8>>,
    /// Opaque token identifying the publisher.
    pub origin: u64,
}

/// Named-channel registry. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BusFrame>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default bus. Providers constructed without an
    /// explicit bus meet each other here.
    pub fn global() -> LocalBus {
        static GLOBAL: OnceLock<LocalBus> = OnceLock::new();
        GLOBAL.get_or_init(LocalBus::new).clone()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusFrame> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a channel. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusFrame> {
        self.sender(channel).subscribe()
    }

    /// Publish a frame to every current subscriber of the channel,
    /// including the publisher's own subscription. Returns the number of
    /// subscribers that received it.
    pub fn publish(&self, channel: &str, data: Vec<u8>, origin: u64) -> usize {
        self.sender(channel)
            .send(BusFrame {
                data: Arc::new(data),
                origin,
            })
            .unwrap_or(0)
    }

    /// Current subscriber count of a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap();
        channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a channel that has no subscribers left. Returns whether it was
    /// removed.
    pub fn remove_if_idle(&self, channel: &str) -> bool {
        let mut channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(channel) {
            if tx.receiver_count() == 0 {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("room-a");

        let count = bus.publish("room-a", vec![1, 2, 3], 7);
        assert_eq!(count, 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(*frame.data, vec![1, 2, 3]);
        assert_eq!(frame.origin, 7);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = LocalBus::new();
        let mut rx_a = bus.subscribe("room-a");
        let _rx_b = bus.subscribe("room-b");

        bus.publish("room-b", vec![9], 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = LocalBus::new();
        let mut rx1 = bus.subscribe("room");
        let mut rx2 = bus.subscribe("room");

        let count = bus.publish("room", vec![5], 1);
        assert_eq!(count, 2);
        assert_eq!(*rx1.recv().await.unwrap().data, vec![5]);
        assert_eq!(*rx2.recv().await.unwrap().data, vec![5]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish("empty", vec![1], 1), 0);
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("room");
        assert_eq!(bus.subscriber_count("room"), 1);
        assert!(!bus.remove_if_idle("room"));

        drop(rx);
        assert!(bus.remove_if_idle("room"));
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_cloned_bus_shares_channels() {
        let bus = LocalBus::new();
        let clone = bus.clone();
        let mut rx = bus.subscribe("room");

        clone.publish("room", vec![8], 2);
        let frame = rx.recv().await.unwrap();
        assert_eq!(*frame.data, vec![8]);
    }
}
