//! Transactional bulk inserts.
//!
//! A batch is written inside one transaction as a sequence of multi-row
//! `INSERT ... VALUES (?, ...), (?, ...)` statements, each carrying at most
//! `chunk_size` rows. Statements are prepared once per distinct chunk row
//! count and reused for every following chunk of the same size, so a batch
//! normally prepares at most two statements: one for full chunks and one
//! for the shorter tail.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::marker::PhantomData;

use duckdb::{Connection, Statement};
use strum_macros::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;
use weather_load_ingest_models::{ConditionRecord, LocationRecord};

/// Maximum rows carried by a single `INSERT` statement.
pub const CHUNK_SIZE: usize = 10_000;

/// A record type that maps onto a fixed table and column list.
pub trait InsertRow: Send + 'static {
    /// Target table.
    const TABLE: &'static str;

    /// Target columns, in bind order.
    const COLUMNS: &'static [&'static str];

    /// Binds this row's values starting at the 1-based parameter `first`.
    ///
    /// # Errors
    ///
    /// Returns the `DuckDB` error if a value cannot be bound.
    fn bind(&self, stmt: &mut Statement<'_>, first: usize) -> duckdb::Result<()>;
}

impl InsertRow for LocationRecord {
    const TABLE: &'static str = "locations";
    const COLUMNS: &'static [&'static str] = &["device_id", "location", "environment"];

    fn bind(&self, stmt: &mut Statement<'_>, first: usize) -> duckdb::Result<()> {
        stmt.raw_bind_parameter(first, &self.device_id)?;
        stmt.raw_bind_parameter(first + 1, &self.location)?;
        stmt.raw_bind_parameter(first + 2, &self.environment)?;
        Ok(())
    }
}

impl InsertRow for ConditionRecord {
    const TABLE: &'static str = "conditions";
    const COLUMNS: &'static [&'static str] = &["time", "device_id", "temperature", "humidity"];

    fn bind(&self, stmt: &mut Statement<'_>, first: usize) -> duckdb::Result<()> {
        // DuckDB casts the text to the TIMESTAMP column on insert.
        let time = self.time.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        stmt.raw_bind_parameter(first, time)?;
        stmt.raw_bind_parameter(first + 1, &self.device_id)?;
        stmt.raw_bind_parameter(first + 2, self.temperature)?;
        stmt.raw_bind_parameter(first + 3, self.humidity)?;
        Ok(())
    }
}

/// Step of [`insert_batch`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum InsertStage {
    /// Opening the transaction.
    Begin,
    /// Preparing a multi-row statement.
    Prepare,
    /// Binding row values.
    Bind,
    /// Executing a chunk.
    Execute,
    /// Committing the transaction.
    Commit,
}

/// Errors returned by [`insert_batch`]. In every case the transaction has
/// been rolled back and none of the batch's rows are visible.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    /// A database call failed.
    #[error("{stage} into {table}: {source}")]
    Database {
        /// Which step failed.
        stage: InsertStage,
        /// Target table.
        table: &'static str,
        /// Underlying `DuckDB` error.
        #[source]
        source: duckdb::Error,
    },

    /// Cancellation was observed between chunks.
    #[error("insert into {table} cancelled")]
    Cancelled {
        /// Target table.
        table: &'static str,
    },
}

impl InsertError {
    /// Returns the failing stage, or `None` for a cancellation.
    #[must_use]
    pub const fn stage(&self) -> Option<InsertStage> {
        match self {
            Self::Database { stage, .. } => Some(*stage),
            Self::Cancelled { .. } => None,
        }
    }

    fn at<T: InsertRow>(stage: InsertStage) -> impl FnOnce(duckdb::Error) -> Self {
        move |source| Self::Database {
            stage,
            table: T::TABLE,
            source,
        }
    }
}

/// Builds `INSERT INTO table (cols) VALUES (?, ..), (?, ..)` for `rows`
/// rows.
#[must_use]
pub fn insert_sql(table: &str, columns: &[&str], rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let mut sql = format!("INSERT INTO {table} ({}) VALUES ", columns.join(", "));

    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&tuple);
    }

    sql
}

/// Prepared `INSERT` statements for one transaction, keyed by the number
/// of rows they carry.
pub struct StatementCache<'conn, T: InsertRow> {
    conn: &'conn Connection,
    statements: BTreeMap<usize, Statement<'conn>>,
    _rows: PhantomData<fn(&T)>,
}

impl<'conn, T: InsertRow> StatementCache<'conn, T> {
    /// Creates an empty cache bound to `conn` (normally a transaction).
    #[must_use]
    pub const fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            statements: BTreeMap::new(),
            _rows: PhantomData,
        }
    }

    /// Returns the statement for `rows` rows, preparing it on first use.
    ///
    /// # Errors
    ///
    /// Returns the `DuckDB` error if preparation fails.
    pub fn statement(&mut self, rows: usize) -> duckdb::Result<&mut Statement<'conn>> {
        match self.statements.entry(rows) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                log::trace!("Preparing {rows}-row insert into {}", T::TABLE);
                let stmt = self.conn.prepare(&insert_sql(T::TABLE, T::COLUMNS, rows))?;
                Ok(entry.insert(stmt))
            }
        }
    }

    /// Number of distinct statements prepared so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Returns `true` if nothing has been prepared yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Inserts `rows` in a single transaction, `chunk_size` rows per statement.
///
/// An empty slice returns `Ok(0)` without opening a transaction. On any
/// error the transaction is dropped, which rolls it back.
///
/// Returns the number of rows inserted.
///
/// # Errors
///
/// Returns [`InsertError`] naming the failing stage, or
/// [`InsertError::Cancelled`] if `cancel` fired before a chunk ran.
pub fn insert_batch<T: InsertRow>(
    conn: &mut Connection,
    rows: &[T],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, InsertError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let tx = conn
        .transaction()
        .map_err(InsertError::at::<T>(InsertStage::Begin))?;
    let mut inserted = 0u64;

    {
        let mut cache = StatementCache::<T>::new(&tx);

        for chunk in rows.chunks(chunk_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(InsertError::Cancelled { table: T::TABLE });
            }

            let stmt = cache
                .statement(chunk.len())
                .map_err(InsertError::at::<T>(InsertStage::Prepare))?;

            let mut param = 1usize;
            for row in chunk {
                row.bind(stmt, param)
                    .map_err(InsertError::at::<T>(InsertStage::Bind))?;
                param += T::COLUMNS.len();
            }

            let count = stmt
                .raw_execute()
                .map_err(InsertError::at::<T>(InsertStage::Execute))?;
            inserted += u64::try_from(count).unwrap_or(0);
        }

        log::trace!(
            "{} rows into {} using {} prepared statement(s)",
            rows.len(),
            T::TABLE,
            cache.len()
        );
    }

    tx.commit()
        .map_err(InsertError::at::<T>(InsertStage::Commit))?;

    Ok(inserted)
}
