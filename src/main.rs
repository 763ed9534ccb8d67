use std::sync::Arc;
use tracing::{error, info};

mod api;
mod bus;
mod chat;
mod config;
mod entity;
mod hub;
mod session;
mod store;

use bus::MessageBus;
use config::{BusBackend, Config};
use session::SessionContext;

async fn connect_bus(backend: &BusBackend) -> anyhow::Result<Arc<dyn MessageBus>> {
    match backend {
        BusBackend::Memory => {
            info!("Using in-process bus (single node only)");
            Ok(Arc::new(bus::MemoryBus::new()))
        }
        #[cfg(feature = "postgres")]
        BusBackend::Postgres(url) => Ok(Arc::new(bus::PostgresBus::connect(url).await?)),
        #[cfg(not(feature = "postgres"))]
        BusBackend::Postgres(_) => {
            anyhow::bail!("PARLEY_BUS points at PostgreSQL but parley was built without the `postgres` feature")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Parley chat server starting...");

    let config = Config::from_env()?;

    info!("Initializing store at {}", config.db_path.display());
    let store = store::Store::new(&config.db_path).await?;
    store.init().await?;

    let bus = connect_bus(&config.bus).await?;

    let (hub, hub_handle) = hub::Hub::new();
    let hub_task = tokio::spawn(hub.run());

    let ctx = SessionContext {
        hub: hub_handle,
        store: Arc::new(store),
        bus,
        config: config.session.clone(),
    };
    let app = api::router(ctx);

    info!("Listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = hub_task => {
            error!("Chat hub stopped unexpectedly");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
