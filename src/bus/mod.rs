//! Publish/subscribe fanout used to reach a user wherever their socket lives.
//!
//! Every connected session subscribes to the channel named after its own user,
//! so a publisher never needs to know which process holds the recipient.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryBus;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBus;

use crate::entity::UserId;
use async_trait::async_trait;
use futures::stream::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHANNEL_PREFIX: &str = "user:";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus broker error: {0}")]
    Broker(#[from] sqlx::Error),
    #[cfg(feature = "postgres")]
    #[error("payload is not valid UTF-8")]
    InvalidPayload,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery to everyone subscribed to `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Opens a subscription. Payloads published after this returns are observed.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// Channel carrying deliveries addressed to `user`.
pub fn user_channel(prefix: &str, user: &UserId) -> String {
    format!("{}{}", prefix, user)
}

/// Handle that closes a [`Subscription`] from any task.
#[derive(Debug, Clone)]
pub struct SubscriptionCloser {
    token: CancellationToken,
}

impl SubscriptionCloser {
    /// Safe to call any number of times.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

type Delivery = Result<Vec<u8>, BusError>;

/// A lazy, non-restartable feed of payloads for one channel.
///
/// Backends push into an unbounded queue from a feeder task that stops as soon
/// as the subscription is closed or dropped.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closer: SubscriptionCloser,
}

impl Subscription {
    fn new(channel: String) -> (Self, Feeder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let feeder = Feeder {
            tx,
            token: token.clone(),
        };
        let sub = Self {
            channel,
            rx,
            closer: SubscriptionCloser { token },
        };
        (sub, feeder)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn closer(&self) -> SubscriptionCloser {
        self.closer.clone()
    }

    /// Next payload, `Some(Err(_))` when the broker fails, `None` once closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        if self.closer.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closer.token.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        async_stream::stream! {
            let mut sub = self;
            while let Some(item) = sub.next().await {
                yield item;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Backend side of a subscription.
struct Feeder {
    tx: mpsc::UnboundedSender<Delivery>,
    token: CancellationToken,
}

impl Feeder {
    /// Resolves once the consumer closed or dropped the subscription.
    async fn stopped(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Returns false when nobody is listening any more.
    fn deliver(&self, item: Delivery) -> bool {
        !self.token.is_cancelled() && self.tx.send(item).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn channels_are_namespaced_per_user() {
        assert_eq!(
            user_channel(DEFAULT_CHANNEL_PREFIX, &UserId::new("42")),
            "user:42"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_feed() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("user:a").await.unwrap();
        let closer = sub.closer();

        bus.publish("user:a", b"one".to_vec()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap(), b"one");

        let remote = closer.clone();
        tokio::spawn(async move { remote.close() }).await.unwrap();
        closer.close();
        sub.closer().close();

        assert!(closer.is_closed());
        assert!(sub.next().await.is_none());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_view_yields_until_closed() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("user:b").await.unwrap();
        let closer = sub.closer();
        let mut stream = Box::pin(sub.into_stream());

        bus.publish("user:b", b"x".to_vec()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"x");

        closer.close();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
