#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` persistence for the area score pipeline.
//!
//! One database file holds every stage's inputs and outputs. The schema is
//! applied from embedded SQL migrations. Every write is an
//! `INSERT OR REPLACE` keyed by the row's natural key, issued in chunks
//! inside a transaction, so re-running a stage overwrites its previous
//! output instead of duplicating it. Outputs that are recomputed wholesale
//! (a year's scores, a resolution's hex mapping and cells) first clear
//! their scope in the same transaction, so rows the new run no longer
//! produces do not linger.

pub mod areas;
pub mod grid;
pub mod paths;
pub mod scores;
pub mod values;

use std::path::Path;

use duckdb::{Statement, ToSql};

pub use duckdb::Connection;
use include_dir::{Dir, include_dir};

/// Embedded SQL migrations from the `migrations/` directory.
static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../migrations");

/// Rows per `INSERT` statement.
pub const CHUNK_SIZE: usize = 1_000;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON column (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A migration file is missing or not UTF-8.
    #[error("Invalid migration {name}")]
    Migration {
        /// Migration directory name.
        name: String,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Opens (or creates) the database at `path` and applies pending
/// migrations.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or a migration fails.
pub fn open(path: &Path) -> Result<Connection, DbError> {
    if let Some(parent) = path.parent() {
        paths::ensure_dir(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("SET threads = 4; SET memory_limit = '1GB';")?;
    run_migrations(&conn)?;

    Ok(conn)
}

/// Opens the database at the default path.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or a migration fails.
pub fn open_default() -> Result<Connection, DbError> {
    open(&paths::db_path())
}

/// Opens a migrated in-memory database.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or a migration fails.
pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Applies every embedded migration not yet recorded in
/// `_migrations`, in directory-name order.
///
/// # Errors
///
/// Returns [`DbError`] if any migration fails to apply.
pub fn run_migrations(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT current_timestamp
        );",
    )?;

    let mut migrations: Vec<&Dir<'_>> = MIGRATIONS_DIR.dirs().collect();
    migrations.sort_by_key(|dir| dir.path());

    let mut applied = 0usize;
    for dir in migrations {
        let name = dir.path().display().to_string();
        let done: i64 = conn
            .prepare("SELECT COUNT(*) FROM _migrations WHERE name = ?")?
            .query_row([&name], |row| row.get(0))?;
        if done > 0 {
            continue;
        }

        let sql = dir
            .get_file(dir.path().join("up.sql"))
            .and_then(|f| f.contents_utf8())
            .ok_or_else(|| DbError::Migration { name: name.clone() })?;

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO _migrations (name) VALUES (?)", [&name])?;
        tx.commit()?;

        log::debug!("Applied migration {name}");
        applied += 1;
    }

    if applied > 0 {
        log::info!("Applied {applied} database migrations");
    }

    Ok(())
}

/// Writes `rows` with `INSERT OR REPLACE` in chunks of [`CHUNK_SIZE`]
/// inside one transaction.
///
/// `bind` receives the statement, the 1-based index of the row's first
/// placeholder, and the row.
///
/// Returns the number of rows written.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails; the transaction is rolled
/// back.
pub(crate) fn upsert_chunked<T>(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    rows: &[T],
    bind: impl Fn(&mut Statement<'_>, usize, &T) -> duckdb::Result<()>,
) -> Result<u64, DbError> {
    if rows.is_empty() {
        return Ok(0);
    }
    write_chunked(conn, None, table, columns, rows, bind)
}

/// Deletes the rows of `table` matching `scope` (a `WHERE` clause and its
/// parameters), then writes `rows` as [`upsert_chunked`] does. Both happen
/// in one transaction, so a failed insert leaves the previous rows intact.
///
/// An empty `rows` still clears the scope.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails; the transaction is rolled
/// back.
pub(crate) fn replace_chunked<T>(
    conn: &Connection,
    scope: (&str, &[&dyn ToSql]),
    table: &str,
    columns: &[&str],
    rows: &[T],
    bind: impl Fn(&mut Statement<'_>, usize, &T) -> duckdb::Result<()>,
) -> Result<u64, DbError> {
    write_chunked(conn, Some(scope), table, columns, rows, bind)
}

fn write_chunked<T>(
    conn: &Connection,
    scope: Option<(&str, &[&dyn ToSql])>,
    table: &str,
    columns: &[&str],
    rows: &[T],
    bind: impl Fn(&mut Statement<'_>, usize, &T) -> duckdb::Result<()>,
) -> Result<u64, DbError> {
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let tx = conn.unchecked_transaction()?;

    if let Some((filter, params)) = scope {
        let removed = tx.execute(&format!("DELETE FROM {table} WHERE {filter}"), params)?;
        log::debug!("Cleared {removed} rows from {table} where {filter}");
    }

    let mut total = 0u64;
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut sql = format!("INSERT OR REPLACE INTO {table} ({}) VALUES ", columns.join(", "));
        sql.push_str(&vec![placeholders.as_str(); chunk.len()].join(", "));

        let mut stmt = tx.prepare(&sql)?;
        for (i, row) in chunk.iter().enumerate() {
            bind(&mut stmt, i * columns.len() + 1, row)?;
        }

        let written = stmt.raw_execute()?;
        total += u64::try_from(written).unwrap_or(0);
    }

    tx.commit()?;
    log::debug!("Wrote {total} rows into {table}");

    Ok(total)
}

/// Number of rows in `table`.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn count_rows(conn: &Connection, table: &str) -> Result<u64, DbError> {
    let count: i64 = conn
        .prepare(&format!("SELECT COUNT(*) FROM {table}"))?
        .query_row([], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Parses a stored enum column.
pub(crate) fn parse_column<T: std::str::FromStr>(column: &str, value: &str) -> Result<T, DbError> {
    value.parse().map_err(|_| DbError::Conversion {
        message: format!("Unknown {column} value {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert_eq!(count_rows(&conn, "_migrations").unwrap(), 1);
        assert_eq!(count_rows(&conn, "composite_scores").unwrap(), 0);
    }

    #[test]
    fn failed_replace_keeps_the_cleared_rows() {
        let conn = open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cells (k INTEGER PRIMARY KEY, v INTEGER NOT NULL);
             INSERT INTO cells VALUES (1, 10), (2, 20);",
        )
        .unwrap();
        let all: [&dyn ToSql; 0] = [];

        let result = replace_chunked(
            &conn,
            ("k > 0", &all),
            "cells",
            &["k", "v"],
            &[(3, None::<i32>)],
            |stmt, i, (k, v)| {
                stmt.raw_bind_parameter(i, k)?;
                stmt.raw_bind_parameter(i + 1, v)
            },
        );

        assert!(result.is_err());
        assert_eq!(count_rows(&conn, "cells").unwrap(), 2);
    }

    #[test]
    fn replace_with_no_rows_clears_the_scope() {
        let conn = open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cells (k INTEGER PRIMARY KEY, v INTEGER NOT NULL);
             INSERT INTO cells VALUES (1, 10), (2, 20);",
        )
        .unwrap();
        let scope: [&dyn ToSql; 1] = [&2];

        let written = replace_chunked(
            &conn,
            ("k = ?", &scope),
            "cells",
            &["k", "v"],
            &[] as &[(i32, i32)],
            |stmt, i, (k, v)| {
                stmt.raw_bind_parameter(i, k)?;
                stmt.raw_bind_parameter(i + 1, v)
            },
        )
        .unwrap();

        assert_eq!(written, 0);
        assert_eq!(count_rows(&conn, "cells").unwrap(), 1);
    }
}
