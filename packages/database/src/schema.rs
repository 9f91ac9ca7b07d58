//! Target tables.
//!
//! The loader only appends; this module exists so a fresh database (or a
//! test) can be prepared with the fixed layout the inserter writes to.

use duckdb::Connection;
use weather_load_ingest_models::Dataset;

use crate::DbError;

/// Creates the `locations` and `conditions` tables if they are missing.
///
/// # Errors
///
/// Returns [`DbError`] if the DDL fails.
pub fn create_tables(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS locations (
            device_id TEXT NOT NULL,
            location TEXT NOT NULL,
            environment TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conditions (
            time TIMESTAMP NOT NULL,
            device_id TEXT NOT NULL,
            temperature DOUBLE NOT NULL,
            humidity DOUBLE NOT NULL
        );",
    )?;

    Ok(())
}

/// Returns the number of rows in the dataset's table.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn row_count(conn: &Connection, dataset: Dataset) -> Result<u64, DbError> {
    let sql = format!("SELECT COUNT(*) FROM {}", dataset.table());
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        assert_eq!(row_count(&conn, Dataset::Locations).unwrap(), 0);
        assert_eq!(row_count(&conn, Dataset::Conditions).unwrap(), 0);
    }
}
