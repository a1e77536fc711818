//! SQLite backend for the Llinatge catalogue.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Each engine (moderation, permissions,
//! ingestion, search, rollups) lives in its own module as synchronous
//! functions over a connection; derived state is refreshed in the same
//! transaction as the write that caused it (see `hooks`).

mod accounts;
mod coerce;
mod db;
mod encode;
mod hooks;
mod ingest;
mod maps;
mod moderation;
mod permissions;
mod registry;
mod rollups;
mod schema;
mod search;
mod store;

pub mod error;

pub use accounts::hash_password;
pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
