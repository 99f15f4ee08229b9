use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub blob_store: Arc<BlobStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/blob/:id", get(blob_download))
        .route("/socket", get(socket_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online_users: usize,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.gateway.sessions();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_users: sessions.online_users().await,
        connections: sessions.connection_count().await,
    })
}

async fn blob_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServerError> {
    let data = state.blob_store.get_blob(id).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

async fn socket_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let gateway = state.gateway.clone();
    ws.max_message_size(state.config.max_transfer_size)
        .on_upgrade(move |socket| ws::run_connection(socket, gateway))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
