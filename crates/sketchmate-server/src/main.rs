//! # sketchmate-server
//!
//! Realtime backend for Sketchmate: websocket sessions, drawing transfers,
//! mate matching and push notifications, plus blob downloads over HTTP.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sketchmate_server::api::{self, AppState};
use sketchmate_server::blob_store::BlobStore;
use sketchmate_server::notify::{FcmTransport, LogTransport, PushTransport, TokenSource};
use sketchmate_server::persistence::SqlitePersistence;
use sketchmate_server::{Gateway, ServerConfig};
use sketchmate_store::Database;

const PUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sketchmate_server=debug")),
        )
        .init();

    info!("Starting Sketchmate server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        blob_path = %config.blob_storage_path.display(),
        push_enabled = config.fcm_project_id.is_some(),
        silent_push_delay_ms = config.silent_push_delay.as_millis() as u64,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database ready");
    let store = Arc::new(SqlitePersistence::new(db));

    let blob_store = Arc::new(
        BlobStore::new(
            config.blob_storage_path.clone(),
            config.max_blob_size,
            config.public_base_url.clone(),
        )
        .await?,
    );

    let transport: Arc<dyn PushTransport> = match &config.fcm_project_id {
        Some(project) => {
            let tokens = match &config.fcm_access_token {
                Some(token) => TokenSource::Static(token.clone()),
                None => TokenSource::Metadata(config.fcm_token_url.clone()),
            };
            info!(project = %project, "Push notifications via FCM HTTP v1");
            Arc::new(FcmTransport::new(&config.fcm_endpoint, project, tokens)?)
        }
        None => {
            warn!("FCM_PROJECT_ID not set, push notifications are only logged");
            Arc::new(LogTransport)
        }
    };

    let gateway = Arc::new(Gateway::new(&config, store, blob_store.clone(), transport));

    let http_addr = config.http_addr;
    let app_state = AppState {
        gateway: gateway.clone(),
        blob_store,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + websocket server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 5. Give detached push deliveries a chance to finish
    // -----------------------------------------------------------------------
    let pending = gateway.pending_pushes();
    if pending > 0 {
        info!(pending, "Waiting for push deliveries");
        if tokio::time::timeout(PUSH_DRAIN_TIMEOUT, gateway.flush_pushes())
            .await
            .is_err()
        {
            warn!(pending = gateway.pending_pushes(), "Push deliveries abandoned");
        }
    }

    Ok(())
}
