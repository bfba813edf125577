//! # parley-store
//!
//! Durable storage for the Parley hub, backed by SQLite.
//!
//! Owns conversations, messages (append-only per conversation with a strictly
//! increasing sequence), reactions, seen-state, and profiles. The crate
//! exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers; the hub drives it
//! through its async gateway adapter.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod profiles;
pub mod reactions;

mod error;

pub use database::Database;
pub use error::StoreError;
