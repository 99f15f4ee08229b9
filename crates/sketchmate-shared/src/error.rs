use thiserror::Error;

/// Malformed inbound traffic on a realtime connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    #[error("Empty binary frame")]
    EmptyFrame,

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
}
