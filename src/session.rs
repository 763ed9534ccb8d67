//! Client session actor: one accepted socket bridged to the bus and the store.
//!
//! A session runs three tasks. The read loop persists inbound messages and
//! publishes them, the write loop drains the outbound queue and keeps the peer
//! alive with pings, and the relay loop moves bus deliveries into the outbound
//! queue. They share one shutdown token; whichever ends first cancels it and
//! the other two follow.

use crate::bus::{user_channel, BusError, MessageBus, Subscription, SubscriptionCloser};
use crate::chat::{ChatMessage, InboundMessage, OutboundMessage};
use crate::config::SessionConfig;
use crate::entity::UserId;
use crate::hub::HubHandle;
use crate::store::ChatStore;
use anyhow::anyhow;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a session needs from the rest of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: HubHandle,
    pub store: Arc<dyn ChatStore>,
    pub bus: Arc<dyn MessageBus>,
    pub config: SessionConfig,
}

/// What the hub keeps for a registered session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    user_id: UserId,
    outbound_closed: CancellationToken,
    subscription: SubscriptionCloser,
}

impl ClientHandle {
    pub(crate) fn new(
        user_id: UserId,
        outbound_closed: CancellationToken,
        subscription: SubscriptionCloser,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            outbound_closed,
            subscription,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Closes the outbound channel and releases the bus subscription.
    /// Idempotent; the write loop answers with a close frame.
    pub fn close(&self) {
        self.outbound_closed.cancel();
        self.subscription.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.outbound_closed.is_cancelled()
    }
}

/// Sending side of the bounded outbound queue.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Queued,
    Full,
    Closed,
}

impl Outbound {
    /// Never waits: a full queue drops the payload.
    fn offer(&self, payload: Vec<u8>) -> Offer {
        if self.closed.is_cancelled() {
            return Offer::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}

/// Join handles of a running session's loops.
pub struct SessionTasks {
    pub handle: ClientHandle,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    relay: JoinHandle<()>,
}

impl SessionTasks {
    /// Waits for all three loops to finish.
    pub async fn join(self) {
        for task in [self.reader, self.writer, self.relay] {
            if let Err(e) = task.await {
                error!("Session task for {} failed: {}", self.handle.user_id, e);
            }
        }
    }
}

/// Subscribes to the user's channel, registers with the hub and starts the loops.
pub async fn start<R, W>(
    ctx: &SessionContext,
    user_id: UserId,
    reader: R,
    writer: W,
) -> Result<SessionTasks, BusError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
{
    let channel = user_channel(&ctx.config.channel_prefix, &user_id);
    let subscription = ctx.bus.subscribe(&channel).await?;

    let (tx, rx) = mpsc::channel(ctx.config.outbound_buffer);
    let outbound = Outbound {
        tx,
        closed: CancellationToken::new(),
    };
    let shutdown = CancellationToken::new();
    let handle = ClientHandle::new(
        user_id.clone(),
        outbound.closed.clone(),
        subscription.closer(),
    );

    ctx.hub.register(handle.clone());
    info!("Session {} started for {}", handle.id, user_id);

    let writer = tokio::spawn(write_loop(
        writer,
        rx,
        outbound.closed.clone(),
        shutdown.clone(),
        ctx.config.clone(),
    ));
    let relay = tokio::spawn(relay_loop(subscription, outbound, shutdown.clone()));
    let reader = tokio::spawn(read_loop(ctx.clone(), handle.clone(), reader, shutdown));

    Ok(SessionTasks {
        handle,
        reader,
        writer,
        relay,
    })
}

async fn read_loop<R>(ctx: SessionContext, handle: ClientHandle, mut reader: R, shutdown: CancellationToken)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let pong_wait = ctx.config.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = tokio::time::timeout_at(deadline, reader.next()) => frame,
        };

        match frame {
            Err(_) => {
                warn!("No pong from {} within {:?}, closing", handle.user_id, pong_wait);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for user {}: {}", handle.user_id, e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => handle_text(&ctx, &handle.user_id, &text).await,
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + pong_wait;
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                info!("User {} closed WebSocket connection", handle.user_id);
                break;
            }
            Ok(Some(Ok(_))) => {
                debug!("Ignoring non-text frame from {}", handle.user_id);
            }
        }
    }

    ctx.hub.unregister(handle.clone());
    shutdown.cancel();
    debug!("Read loop for {} finished", handle.user_id);
}

async fn handle_text(ctx: &SessionContext, sender: &UserId, text: &str) {
    let inbound = match InboundMessage::decode(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!("Error decoding incoming message from {}: {}", sender, e);
            return;
        }
    };

    let room = match ctx.store.find_or_create_room(sender, &inbound.recipient).await {
        Ok(room) => room,
        Err(e) => {
            error!("Could not find or create chat room: {:#}", e);
            return;
        }
    };

    let message = match ctx.store.create_message(&room.id, sender, &inbound.content).await {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to save message to database: {:#}", e);
            return;
        }
    };

    deliver(
        ctx.bus.as_ref(),
        &ctx.config.channel_prefix,
        &message,
        &inbound.recipient,
    )
    .await;
}

/// Publishes a persisted message to the recipient's channel and then to the
/// sender's own, so the sender's other sessions see it too. Best effort:
/// failures are logged and not retried. Returns how many publishes succeeded.
pub async fn deliver(
    bus: &dyn MessageBus,
    prefix: &str,
    message: &ChatMessage,
    recipient: &UserId,
) -> usize {
    let payload = match OutboundMessage::from(message).encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Error encoding outgoing message: {}", e);
            return 0;
        }
    };

    let mut delivered = 0;
    for user in [recipient, &message.sender_id] {
        let channel = user_channel(prefix, user);
        match bus.publish(&channel, payload.clone()).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("Error publishing message to user {} on channel {}: {}", user, channel, e),
        }
    }
    delivered
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    outbound_closed: CancellationToken,
    shutdown: CancellationToken,
    config: SessionConfig,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            biased;
            _ = outbound_closed.cancelled() => {
                let _ = send_frame(&mut writer, Message::Close(None), config.write_wait).await;
                break;
            }
            _ = shutdown.cancelled() => break,
            payload = rx.recv() => {
                let Some(payload) = payload else {
                    let _ = send_frame(&mut writer, Message::Close(None), config.write_wait).await;
                    break;
                };
                let text = match String::from_utf8(payload) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 payload");
                        continue;
                    }
                };
                if let Err(e) = send_frame(&mut writer, Message::Text(text), config.write_wait).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = send_frame(&mut writer, Message::Ping(Vec::new()), config.write_wait).await {
                    debug!("Ping failed: {}", e);
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(config.write_wait, writer.close()).await;
}

async fn send_frame<W>(writer: &mut W, frame: Message, wait: Duration) -> anyhow::Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, writer.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!("socket write failed: {}", e)),
        Err(_) => Err(anyhow!("write deadline of {:?} exceeded", wait)),
    }
}

async fn relay_loop(subscription: Subscription, outbound: Outbound, shutdown: CancellationToken) {
    let channel = subscription.channel().to_string();
    debug!("Relaying {} to its session", channel);

    // Dropping the stream closes the subscription.
    let mut deliveries = pin!(subscription.into_stream());

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = deliveries.next() => delivery,
        };

        match delivery {
            Some(Ok(payload)) => match outbound.offer(payload) {
                Offer::Queued => {}
                Offer::Full => warn!("Send channel full for {}, dropping message", channel),
                Offer::Closed => break,
            },
            Some(Err(e)) => {
                error!("Subscription on {} failed: {}", channel, e);
                shutdown.cancel();
                break;
            }
            None => break,
        }
    }

    debug!("Closing subscription on {}", channel);
}
