use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use sketchmate_shared::{InboxId, ProtocolError, UserId};
use sketchmate_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Cannot match to oneself")]
    SelfMatch,

    #[error("Already matched")]
    AlreadyMatched,

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Inbox item not found: {0}")]
    InboxItemNotFound(InboxId),

    #[error("Malformed transfer: {0}")]
    TransferDecode(String),

    #[error("Transfer exceeds {limit} bytes")]
    TransferTooLarge { limit: usize },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Blob not found: {0}")]
    BlobNotFound(Uuid),

    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Text shown to clients. Storage and internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Persistence(_) => "Storage unavailable".to_string(),
            ServerError::BlobStorage(_) => "Blob storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::SelfMatch | ServerError::AlreadyMatched => StatusCode::CONFLICT,
            ServerError::UserNotFound(_)
            | ServerError::InboxItemNotFound(_)
            | ServerError::BlobNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::TransferTooLarge { .. } | ServerError::BlobTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ServerError::TransferDecode(_)
            | ServerError::Image(_)
            | ServerError::Protocol(_)
            | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Persistence(_)
            | ServerError::BlobStorage(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.client_message(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
