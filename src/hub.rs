//! Process-wide registry of live client sessions.
//!
//! The registry map is owned by [`Hub::run`]; everything else talks to it
//! through a [`HubHandle`], so only the event loop ever mutates it.

use crate::entity::UserId;
use crate::session::ClientHandle;
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientHandle),
    Online(oneshot::Sender<Vec<UserId>>),
}

/// Cheap, cloneable entry point to the hub's event loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Queues `client` to replace whatever session its user currently has.
    pub fn register(&self, client: ClientHandle) {
        info!("Attempting to register client: {}", client.user_id());
        if self.tx.send(HubCommand::Register(client)).is_err() {
            warn!("Hub is not running, registration dropped");
        }
    }

    /// Queues removal of `client`; ignored if a newer session took its place.
    pub fn unregister(&self, client: ClientHandle) {
        if self.tx.send(HubCommand::Unregister(client)).is_err() {
            debug!("Hub is not running, unregistration dropped");
        }
    }

    /// Users with a registered session on this process.
    pub async fn online_users(&self) -> Result<Vec<UserId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Online(reply))
            .ok()
            .context("hub is not running")?;
        rx.await.context("hub stopped before replying")
    }

    pub async fn is_online(&self, user: &UserId) -> Result<bool> {
        Ok(self.online_users().await?.contains(user))
    }
}

pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<UserId, ClientHandle>,
}

impl Hub {
    /// Creates the hub and its handle. Submissions queue until [`Hub::run`] starts.
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            rx,
            clients: HashMap::new(),
        };
        (hub, HubHandle { tx })
    }

    /// Serves submissions until every handle has been dropped.
    pub async fn run(mut self) {
        info!("Chat hub started and running...");
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register(client) => self.register(client),
                HubCommand::Unregister(client) => self.unregister(client),
                HubCommand::Online(reply) => {
                    let _ = reply.send(self.clients.keys().cloned().collect());
                }
            }
        }

        for (_, client) in self.clients.drain() {
            client.close();
        }
        info!("Chat hub stopped");
    }

    fn register(&mut self, client: ClientHandle) {
        let user_id = client.user_id().clone();
        if let Some(previous) = self.clients.insert(user_id.clone(), client) {
            // The displaced connection is closed rather than left to fail on its own.
            previous.close();
            info!("Replaced existing session for {}", user_id);
        }
        info!(
            "Client registered: {} (Total clients: {})",
            user_id,
            self.clients.len()
        );
    }

    fn unregister(&mut self, client: ClientHandle) {
        let current = self.clients.get(client.user_id());
        if !current.is_some_and(|current| current.id() == client.id()) {
            debug!("Ignoring stale unregister for {}", client.user_id());
            return;
        }

        if let Some(removed) = self.clients.remove(client.user_id()) {
            removed.close();
        }
        info!(
            "Client unregistered: {} (Total clients: {})",
            client.user_id(),
            self.clients.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus, Subscription};
    use tokio_util::sync::CancellationToken;

    /// The subscription is returned so it outlives the helper; dropping it
    /// would close it regardless of what the hub does.
    async fn client(bus: &MemoryBus, user: &str) -> (ClientHandle, Subscription) {
        let sub = bus.subscribe(&format!("user:{}", user)).await.unwrap();
        let handle = ClientHandle::new(UserId::new(user), CancellationToken::new(), sub.closer());
        (handle, sub)
    }

    fn spawn_hub() -> HubHandle {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());
        handle
    }

    #[tokio::test]
    async fn submissions_queue_until_the_loop_runs() {
        let bus = MemoryBus::new();
        let (hub, handle) = Hub::new();
        let (alice, _alice_sub) = client(&bus, "alice").await;
        handle.register(alice);

        tokio::spawn(hub.run());
        assert_eq!(handle.online_users().await.unwrap(), vec![UserId::new("alice")]);
    }

    #[tokio::test]
    async fn register_replaces_and_closes_previous_session() {
        let bus = MemoryBus::new();
        let hub = spawn_hub();
        let (first, mut first_sub) = client(&bus, "alice").await;
        let (second, second_sub) = client(&bus, "alice").await;

        hub.register(first.clone());
        assert_eq!(hub.online_users().await.unwrap().len(), 1);
        assert!(!first_sub.closer().is_closed());

        hub.register(second.clone());
        assert_eq!(hub.online_users().await.unwrap().len(), 1);
        assert!(first.is_closed());
        assert!(first_sub.closer().is_closed());
        assert!(first_sub.next().await.is_none());
        assert!(!second.is_closed());
        assert!(!second_sub.closer().is_closed());
    }

    #[tokio::test]
    async fn stale_unregister_does_not_evict_newer_session() {
        let bus = MemoryBus::new();
        let hub = spawn_hub();
        let (first, _first_sub) = client(&bus, "alice").await;
        let (second, second_sub) = client(&bus, "alice").await;

        hub.register(first.clone());
        hub.register(second.clone());
        hub.unregister(first);

        assert!(hub.is_online(&UserId::new("alice")).await.unwrap());
        assert!(!second.is_closed());
        assert!(!second_sub.closer().is_closed());

        hub.unregister(second.clone());
        assert!(!hub.is_online(&UserId::new("alice")).await.unwrap());
        assert!(second.is_closed());
        assert!(second_sub.closer().is_closed());
    }

    #[tokio::test]
    async fn unregister_closes_outbound_and_subscription() {
        let bus = MemoryBus::new();
        let hub = spawn_hub();
        let (alice, alice_sub) = client(&bus, "alice").await;
        let (bob, bob_sub) = client(&bus, "bob").await;

        hub.register(alice.clone());
        hub.register(bob);
        assert_eq!(hub.online_users().await.unwrap().len(), 2);
        assert!(!alice_sub.closer().is_closed());

        hub.unregister(alice.clone());

        assert_eq!(hub.online_users().await.unwrap(), vec![UserId::new("bob")]);
        assert!(alice.is_closed());
        assert!(alice_sub.closer().is_closed());
        assert!(!bob_sub.closer().is_closed());

        // Closing again is harmless.
        alice.close();
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_loop_and_closes_sessions() {
        let bus = MemoryBus::new();
        let (hub, handle) = Hub::new();
        let (alice, alice_sub) = client(&bus, "alice").await;
        handle.register(alice.clone());

        let running = tokio::spawn(hub.run());
        drop(handle);
        running.await.unwrap();
        assert!(alice.is_closed());
        assert!(alice_sub.closer().is_closed());
    }
}
