//! # parley-server
//!
//! Real-time messaging backend for the Parley network.
//!
//! This binary provides:
//! - **WebSocket sessions** carrying chat commands in and hub events out
//! - **The conversation hub**: write-then-fan-out message delivery with
//!   per-conversation ordering, presence, typing, reactions, read receipts
//!   and call signaling
//! - **Image blob storage** backing image messages
//! - **REST API** (axum) for session provisioning, conversation management,
//!   history reads and uploads
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod auth;
mod blob_store;
mod config;
mod error;
mod rate_limit;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_hub::{
    ConversationHub, Gateway, LogNotifier, PresenceTracker, SessionRegistry, SqliteGateway,
};
use parley_store::Database;

use crate::api::AppState;
use crate::auth::Authenticator;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley hub server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let gateway: Arc<dyn Gateway> = Arc::new(SqliteGateway::new(db));

    let sessions = Arc::new(SessionRegistry::new());
    let presence = Arc::new(PresenceTracker::new(gateway.clone()));
    let hub = Arc::new(ConversationHub::new(
        gateway,
        sessions,
        presence,
        Arc::new(LogNotifier),
    ));

    let blob_store = Arc::new(
        BlobStore::new(config.blob_storage_path.clone(), config.max_image_size).await?,
    );

    let auth = Arc::new(Authenticator::new());

    let rate_limiter = RateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst);

    let app_state = AppState {
        hub,
        blob_store,
        auth,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(std::time::Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
