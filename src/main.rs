//! session-relay server daemon.
//!
//! Binds the HTTP/WebSocket API, connects to the shared store if one is
//! configured, and runs until interrupted. A missing or unreachable store is
//! not fatal: the process serves its own sockets in local-only mode and logs
//! the degradation.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_relay::{
    api,
    config::{self, RelayConfig},
    coordinator::Coordinator,
    store::{MemoryStore, RedisStore, SharedStore},
};

/// session-relay - real-time session event fan-out across server processes.
#[derive(Parser, Debug)]
#[command(name = "session-relay", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket API server
    /// (default 127.0.0.1:8080, config file can override)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Shared store URL; omit to run single-process with an in-memory store
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Path to a TOML config file (flags take precedence)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the generated server id
    #[arg(long)]
    server_id: Option<String>,

    /// Directory TTL in seconds
    #[arg(long)]
    ttl_seconds: Option<u64>,
}

#[derive(Error, Debug)]
enum RelayError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid server id: {0}")]
    ServerId(String),

    #[error("invalid bind address: {0}")]
    Bind(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let cli = Cli::parse();
    init_tracing();

    let file_config = match &cli.config {
        Some(path) => RelayConfig::load(path)?.unwrap_or_default(),
        None => RelayConfig::default(),
    };

    let bind: SocketAddr = match (cli.bind, &file_config.bind) {
        (Some(bind), _) => bind,
        (None, Some(raw)) => raw.parse().map_err(|_| RelayError::Bind(raw.clone()))?,
        (None, None) => SocketAddr::from(([127, 0, 0, 1], 8080)),
    };
    let store_url = cli
        .redis_url
        .clone()
        .or_else(|| file_config.store_url().map(str::to_string));
    let ttl_seconds = cli.ttl_seconds.unwrap_or_else(|| file_config.ttl_seconds());
    let server_id = cli
        .server_id
        .clone()
        .or_else(|| file_config.server.as_ref().and_then(|s| s.id.clone()));
    if let Some(id) = &server_id {
        config::validate_server_id(id).map_err(RelayError::ServerId)?;
    }

    let store = match &store_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => SharedStore::Redis(store),
            Err(err) => {
                tracing::warn!(
                    "shared store unreachable, starting in local-only mode: {err}"
                );
                SharedStore::Memory(MemoryStore::new())
            }
        },
        None => {
            tracing::info!("no store URL configured, using in-process store");
            SharedStore::Memory(MemoryStore::new())
        }
    };

    let relay = match server_id {
        Some(id) => Coordinator::with_server_id(store, ttl_seconds, &id),
        None => Coordinator::new(store, ttl_seconds),
    };

    // The rest of the service must come up even if the store ping fails;
    // the relay just won't replicate across processes until restarted.
    if let Err(err) = relay.initialize().await {
        tracing::warn!("relay initialization failed, real-time fan-out is local-only: {err}");
    }

    let state = api::AppState {
        relay: relay.clone(),
    };
    api::serve(bind, state, shutdown_signal()).await?;

    relay.cleanup().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {err}");
        return;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "session_relay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
