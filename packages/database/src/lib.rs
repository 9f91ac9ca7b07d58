#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! `DuckDB` storage for the weather loader.
//!
//! [`db::Database`] is the shared connection handle; every insertion unit
//! gets its own cloned connection and its own transaction from it.
//! [`bulk::insert_batch`] writes one batch as a single transaction made of
//! chunked multi-row `INSERT` statements.

pub mod bulk;
pub mod db;
pub mod paths;
pub mod schema;

pub use bulk::{InsertError, InsertRow, InsertStage, insert_batch};
pub use db::{Database, SessionOptions};

/// Errors that can occur while opening or configuring the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (creating the data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
