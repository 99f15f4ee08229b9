//! Types shared by the Sketchmate store and server crates: identifiers, the
//! persisted user/inbox documents and the realtime wire protocol.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use models::*;
pub use types::{FrameType, InboxId, Platform, UserId};
