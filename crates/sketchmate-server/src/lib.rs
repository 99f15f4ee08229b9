//! Realtime core of the Sketchmate backend.
//!
//! Connections are tracked by the [`session`] registry, drawings arriving as
//! two chunked streams are rebuilt by [`transfer`], mate relations are kept
//! symmetric by [`matching`], and every outbound event goes through
//! [`dispatch`] with push fallback from [`notify`]. [`gateway`] ties these
//! together per inbound event; [`ws`] and [`api`] are the network surface.

pub mod api;
pub mod blob_store;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod matching;
pub mod messaging;
pub mod notify;
pub mod persistence;
pub mod session;
pub mod thumbnail;
pub mod transfer;
pub mod ws;

pub use config::ServerConfig;
pub use error::ServerError;
pub use gateway::Gateway;
