//! Database handle and session tuning.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use duckdb::Connection;

use crate::DbError;

/// Environment variable naming the `DuckDB` file to load into.
pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";

/// Path value that selects an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Session-level settings applied once after the database is opened.
///
/// These are the embedded-store counterparts of the durability knobs a
/// server database would expose; `None` leaves the `DuckDB` default alone.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Worker threads `DuckDB` may use (`SET threads`).
    pub threads: Option<u32>,
    /// Memory cap such as `"2GB"` (`SET memory_limit`).
    pub memory_limit: Option<String>,
    /// When `false`, lets `DuckDB` reorder appended rows for speed
    /// (`SET preserve_insertion_order`).
    pub preserve_insertion_order: Option<bool>,
}

impl SessionOptions {
    fn statements(&self) -> Vec<String> {
        let mut sql = Vec::new();
        if let Some(threads) = self.threads {
            sql.push(format!("SET threads = {threads};"));
        }
        if let Some(limit) = &self.memory_limit {
            sql.push(format!("SET memory_limit = '{}';", limit.replace('\'', "''")));
        }
        if let Some(preserve) = self.preserve_insertion_order {
            sql.push(format!("SET preserve_insertion_order = {preserve};"));
        }
        sql
    }

    /// Applies the configured settings to `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if `DuckDB` rejects a setting.
    pub fn apply(&self, conn: &Connection) -> Result<(), DbError> {
        for statement in self.statements() {
            log::debug!("Session: {statement}");
            conn.execute_batch(&statement)?;
        }
        Ok(())
    }
}

/// Shared handle to one `DuckDB` database.
///
/// `duckdb::Connection` is `Send` but not `Sync`, so the root connection is
/// kept behind a `Mutex` and only used to clone per-unit connections. Each
/// clone talks to the same database instance and runs its own transactions,
/// so concurrent units need no further locking.
pub struct Database {
    root: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database file at `path` and applies
    /// `session`. The path `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, the connection, or a session
    /// setting fails.
    pub fn open(path: &Path, session: &SessionOptions) -> Result<Self, DbError> {
        if path.as_os_str() == IN_MEMORY {
            return Self::open_in_memory(session);
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            crate::paths::ensure_dir(parent)?;
        }

        log::info!("Opening DuckDB database at {}", path.display());
        let conn = Connection::open(path)?;
        session.apply(&conn)?;

        Ok(Self::from_connection(conn))
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or a session setting fails.
    pub fn open_in_memory(session: &SessionOptions) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        session.apply(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Opens the database named by `DATABASE_PATH`, falling back to
    /// [`crate::paths::default_db_path`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if opening fails.
    pub fn open_from_env(session: &SessionOptions) -> Result<Self, DbError> {
        let path = std::env::var(DATABASE_PATH_ENV)
            .map_or_else(|_| crate::paths::default_db_path(), Into::into);
        Self::open(&path, session)
    }

    /// Wraps an already configured connection.
    #[must_use]
    pub const fn from_connection(conn: Connection) -> Self {
        Self {
            root: Mutex::new(conn),
        }
    }

    /// Returns a new connection to the same database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if `DuckDB` cannot create the connection.
    pub fn connect(&self) -> Result<Connection, DbError> {
        let root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(root.try_clone()?)
    }
}
