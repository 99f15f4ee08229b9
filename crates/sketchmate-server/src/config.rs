//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use sketchmate_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_SILENT_PUSH_DELAY_MS, MAX_BLOB_SIZE, MAX_TRANSFER_SIZE,
    THUMBNAIL_SIZE,
};

const DEFAULT_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + websocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:4000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Filesystem path where drawing/image/thumbnail blobs are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Prefix of the blob URLs handed to clients (`<prefix>/blob/<id>`).
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:4000`
    pub public_base_url: String,

    /// Maximum blob size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    pub max_blob_size: usize,

    /// Per-stream bound on a pending transfer, in bytes. Also bounds the
    /// decompressed size of the text stream.
    /// Env: `MAX_TRANSFER_SIZE`
    pub max_transfer_size: usize,

    /// Delay before the silent copy of a dual push is sent.
    /// Env: `SILENT_PUSH_DELAY_MS`
    /// Default: 3000 ms
    pub silent_push_delay: Duration,

    /// Firebase project that owns the device tokens. Without it pushes are
    /// only logged.
    /// Env: `FCM_PROJECT_ID`
    pub fcm_project_id: Option<String>,

    /// Fixed OAuth2 access token for FCM. When unset, tokens are fetched from
    /// `fcm_token_url`.
    /// Env: `FCM_ACCESS_TOKEN`
    pub fcm_access_token: Option<String>,

    /// Base URL of the FCM HTTP v1 API.
    /// Env: `FCM_ENDPOINT`
    /// Default: `https://fcm.googleapis.com`
    pub fcm_endpoint: String,

    /// Token endpoint of the instance's service account.
    /// Env: `FCM_TOKEN_URL`
    /// Default: the GCE metadata server.
    pub fcm_token_url: String,

    /// Longest edge of generated thumbnails, in pixels.
    /// Env: `THUMBNAIL_SIZE`
    pub thumbnail_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            blob_storage_path: PathBuf::from("./blobs"),
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            max_blob_size: MAX_BLOB_SIZE,
            max_transfer_size: MAX_TRANSFER_SIZE,
            silent_push_delay: Duration::from_millis(DEFAULT_SILENT_PUSH_DELAY_MS),
            fcm_project_id: None,
            fcm_access_token: None,
            fcm_endpoint: "https://fcm.googleapis.com".to_string(),
            fcm_token_url: DEFAULT_TOKEN_URL.to_string(),
            thumbnail_size: THUMBNAIL_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(n) = parse_number::<usize>(&lookup, "MAX_BLOB_SIZE") {
            config.max_blob_size = n;
        }

        if let Some(n) = parse_number::<usize>(&lookup, "MAX_TRANSFER_SIZE") {
            config.max_transfer_size = n;
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "SILENT_PUSH_DELAY_MS") {
            config.silent_push_delay = Duration::from_millis(ms);
        }

        if let Some(project) = lookup("FCM_PROJECT_ID").filter(|p| !p.is_empty()) {
            config.fcm_project_id = Some(project);
        }

        if let Some(token) = lookup("FCM_ACCESS_TOKEN").filter(|t| !t.is_empty()) {
            config.fcm_access_token = Some(token);
        }

        if let Some(endpoint) = lookup("FCM_ENDPOINT") {
            config.fcm_endpoint = endpoint.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("FCM_TOKEN_URL") {
            config.fcm_token_url = url;
        }

        if let Some(n) = parse_number::<u32>(&lookup, "THUMBNAIL_SIZE") {
            config.thumbnail_size = n.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
