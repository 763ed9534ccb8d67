use super::{BusError, MessageBus, Subscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>;

/// Single-process bus: one broadcast channel per named channel.
///
/// A channel lives while it has at least one subscriber.
pub struct MemoryBus {
    channels: Channels,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, channel: &str) -> Option<broadcast::Sender<Vec<u8>>> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).cloned()
    }
}

/// Forgets `channel` once nobody receives on it any more.
fn prune(channels: &Channels, channel: &str) {
    let mut channels = channels.lock().unwrap_or_else(PoisonError::into_inner);
    if channels.get(channel).is_some_and(|tx| tx.receiver_count() == 0) {
        channels.remove(channel);
        debug!("Dropped idle channel {}", channel);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let Some(tx) = self.sender(channel) else {
            debug!("No subscribers on {}, dropping payload", channel);
            return Ok(());
        };

        if tx.send(payload).is_err() {
            prune(&self.channels, channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut rx = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (sub, feeder) = Subscription::new(channel.to_string());
        let channel = channel.to_string();
        let channels = self.channels.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feeder.stopped() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => {
                            if !feeder.deliver(Ok(payload)) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, skipped {} payloads", channel, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            drop(rx);
            prune(&channels, &channel);
            debug!("Subscription feeder for {} stopped", channel);
        });

        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until_empty(bus: &MemoryBus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !bus.channels.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("idle channels were not released");
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_channel_only() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("user:a").await.unwrap();
        let mut second = bus.subscribe("user:a").await.unwrap();
        let mut other = bus.subscribe("user:b").await.unwrap();

        bus.publish("user:a", b"hello".to_vec()).await.unwrap();
        bus.publish("user:b", b"bye".to_vec()).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap(), b"hello");
        assert_eq!(second.next().await.unwrap().unwrap(), b"hello");
        assert_eq!(other.next().await.unwrap().unwrap(), b"bye");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = MemoryBus::new();
        bus.publish("user:nobody", b"lost".to_vec()).await.unwrap();

        let sub = bus.subscribe("user:gone").await.unwrap();
        drop(sub);
        tokio::task::yield_now().await;
        bus.publish("user:gone", b"lost".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn per_channel_order_is_preserved() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("user:a").await.unwrap();
        for i in 0..10u8 {
            bus.publish("user:a", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.next().await.unwrap().unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn closed_subscriptions_release_their_channels() {
        let bus = MemoryBus::new();
        for i in 0..100 {
            let sub = bus.subscribe(&format!("user:{}", i)).await.unwrap();
            drop(sub);
        }
        wait_until_empty(&bus).await;
    }

    #[tokio::test]
    async fn channel_survives_while_another_subscriber_remains() {
        let bus = MemoryBus::new();
        let first = bus.subscribe("user:a").await.unwrap();
        let mut second = bus.subscribe("user:a").await.unwrap();

        first.closer().close();
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(bus.channels.lock().unwrap().contains_key("user:a"));
        bus.publish("user:a", b"still".to_vec()).await.unwrap();
        assert_eq!(second.next().await.unwrap().unwrap(), b"still");

        drop(second);
        wait_until_empty(&bus).await;
    }
}
