use super::{BusError, MessageBus, Subscription};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tracing::{debug, error, info};

/// Cross-process bus on PostgreSQL `NOTIFY`/`LISTEN`.
///
/// Payloads travel as notification text, so they must be UTF-8 and stay under
/// the server's 8000 byte notification limit.
pub struct PostgresBus {
    pool: PgPool,
}

impl PostgresBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        info!("PostgreSQL bus connected");
        Ok(Self { pool })
    }
}

#[async_trait]
impl MessageBus for PostgresBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let payload = String::from_utf8(payload).map_err(|_| BusError::InvalidPayload)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        let (sub, feeder) = Subscription::new(channel.to_string());
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feeder.stopped() => break,
                    notification = listener.recv() => match notification {
                        Ok(notification) => {
                            if !feeder.deliver(Ok(notification.payload().as_bytes().to_vec())) {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Listener on {} failed: {}", channel, e);
                            feeder.deliver(Err(e.into()));
                            break;
                        }
                    }
                }
            }
            debug!("Listener for {} stopped", channel);
        });

        Ok(sub)
    }
}
