//! # sketchmate-store
//!
//! SQLite persistence for Sketchmate user and inbox documents.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`. List-valued document fields are stored as JSON
//! columns, and every mutation goes through the update vocabulary of
//! `sketchmate-shared` inside a transaction, so a read-modify-write of one
//! record is atomic.

pub mod database;
pub mod inbox;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
