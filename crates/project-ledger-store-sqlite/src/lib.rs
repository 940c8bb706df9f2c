#![allow(clippy::missing_errors_doc)]

//! SQLite-backed [`TabularStore`].
//!
//! Each logical table is a sparse grid of cells keyed by 1-based row and
//! column index, so the store reproduces spreadsheet semantics exactly: the
//! header row is row 1, blanked cells stay in place and rows are never
//! deleted. Each trait call runs in its own immediate transaction; nothing
//! spans calls.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use project_ledger_core::{
    cell, format_timestamp, LedgerError, Row, Table, TableSnapshot, TabularStore,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

const STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS sheet_cells (
  sheet TEXT NOT NULL,
  row_index INTEGER NOT NULL CHECK (row_index >= 1),
  col_index INTEGER NOT NULL CHECK (col_index >= 1),
  value TEXT NOT NULL,
  PRIMARY KEY (sheet, row_index, col_index)
);
";

pub struct SqliteTableStore {
    conn: Connection,
}

impl SqliteTableStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STORE_V1)
            .context("failed to apply sheet schema")?;

        let now = format_timestamp(OffsetDateTime::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_MIGRATION_VERSION, now],
            )
            .context("failed to register sheet schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .optional()
            .map(Option::flatten)
            .context("failed to read schema version")
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn snapshot(&self, table: Table) -> Result<TableSnapshot> {
        let sheet = table.name();

        let mut header_stmt = self.conn.prepare(
            "SELECT col_index, value FROM sheet_cells
             WHERE sheet = ?1 AND row_index = 1
             ORDER BY col_index ASC",
        )?;
        let header_cells = collect_rows(header_stmt.query_map(params![sheet], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?)?;

        let mut headers = Vec::new();
        for (col_index, value) in header_cells {
            let position = to_position(col_index)?;
            if headers.len() <= position {
                headers.resize(position + 1, String::new());
            }
            headers[position] = value;
        }

        let mut data_stmt = self.conn.prepare(
            "SELECT row_index, col_index, value FROM sheet_cells
             WHERE sheet = ?1 AND row_index > 1
             ORDER BY row_index ASC, col_index ASC",
        )?;
        let data_cells = collect_rows(data_stmt.query_map(params![sheet], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?)?;

        let mut rows: Vec<Row> = Vec::new();
        for (row_index, col_index, value) in data_cells {
            // Row 2 is the first data row.
            let position = to_position(row_index)? - 1;
            while rows.len() <= position {
                rows.push(blank_row(&headers));
            }
            let column = to_position(col_index)?;
            if let Some(header) = headers.get(column).filter(|header| !header.is_empty()) {
                rows[position].insert(header.clone(), value);
            }
        }

        Ok(TableSnapshot { headers, rows })
    }

    pub fn append_values(&self, table: Table, row: &Row) -> Result<usize> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to begin append transaction")?;
        let sheet = table.name();

        let headers = header_cells(&tx, sheet)?;
        if headers.is_empty() {
            return Err(anyhow!("cannot append to {sheet}: no header row"));
        }

        let last_row: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(row_index), 1) FROM sheet_cells WHERE sheet = ?1",
                params![sheet],
                |result| result.get(0),
            )
            .context("failed to read last row index")?;
        let row_index = last_row + 1;

        for (col_index, header) in headers {
            tx.execute(
                "INSERT INTO sheet_cells(sheet, row_index, col_index, value) VALUES (?1, ?2, ?3, ?4)",
                params![sheet, row_index, col_index, cell(row, &header)],
            )
            .with_context(|| format!("failed to append {sheet} row {row_index}"))?;
        }

        tx.commit().context("failed to commit append")?;
        debug!(sheet, row_index, "row appended");
        usize::try_from(row_index).with_context(|| format!("invalid row index: {row_index}"))
    }

    pub fn set_cell(
        &self,
        table: Table,
        row_index: usize,
        col_index: usize,
        value: &str,
    ) -> Result<()> {
        let row_index = i64::try_from(row_index).context("row index out of range")?;
        let col_index = i64::try_from(col_index).context("column index out of range")?;
        self.conn
            .execute(
                "INSERT INTO sheet_cells(sheet, row_index, col_index, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(sheet, row_index, col_index) DO UPDATE SET value = excluded.value",
                params![table.name(), row_index, col_index, value],
            )
            .with_context(|| {
                format!("failed to update {} cell ({row_index}, {col_index})", table.name())
            })?;
        Ok(())
    }

    /// Returns the header names that were added.
    pub fn ensure_columns(&self, table: Table, expected: &[&str]) -> Result<Vec<String>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to begin header transaction")?;
        let sheet = table.name();

        let existing = header_cells(&tx, sheet)?;
        let last_col: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(col_index), 0) FROM sheet_cells WHERE sheet = ?1 AND row_index = 1",
                params![sheet],
                |result| result.get(0),
            )
            .context("failed to read last header column")?;
        let mut next_col = last_col + 1;
        let mut added = Vec::new();

        for name in expected {
            let known = existing.iter().any(|(_, header)| header.as_str() == *name)
                || added.iter().any(|header: &String| header.as_str() == *name);
            if known {
                continue;
            }
            tx.execute(
                "INSERT INTO sheet_cells(sheet, row_index, col_index, value) VALUES (?1, 1, ?2, ?3)",
                params![sheet, next_col, name],
            )
            .with_context(|| format!("failed to add {sheet} header {name}"))?;
            next_col += 1;
            added.push((*name).to_string());
        }

        tx.commit().context("failed to commit header changes")?;
        if !added.is_empty() {
            debug!(sheet, added = ?added, "headers added");
        }
        Ok(added)
    }
}

impl TabularStore for SqliteTableStore {
    fn read_all_rows(&self, table: Table) -> Result<TableSnapshot, LedgerError> {
        self.snapshot(table).map_err(store_error)
    }

    fn append_row(&self, table: Table, row: &Row) -> Result<(), LedgerError> {
        self.append_values(table, row).map(|_| ()).map_err(store_error)
    }

    fn update_cell(
        &self,
        table: Table,
        row_index: usize,
        column_index: usize,
        value: &str,
    ) -> Result<(), LedgerError> {
        if row_index == 0 || column_index == 0 {
            return Err(LedgerError::Validation(
                "row and column indices are 1-based".to_string(),
            ));
        }
        self.set_cell(table, row_index, column_index, value)
            .map_err(store_error)
    }

    fn ensure_headers(&self, table: Table, expected: &[&str]) -> Result<(), LedgerError> {
        self.ensure_columns(table, expected)
            .map(|_| ())
            .map_err(store_error)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> LedgerError {
    LedgerError::Store(format!("{err:#}"))
}

fn header_cells(conn: &Connection, sheet: &str) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT col_index, value FROM sheet_cells
         WHERE sheet = ?1 AND row_index = 1 AND value <> ''
         ORDER BY col_index ASC",
    )?;
    let rows = stmt.query_map(params![sheet], |row| Ok((row.get(0)?, row.get(1)?)))?;
    collect_rows(rows)
}

fn blank_row(headers: &[String]) -> Row {
    headers
        .iter()
        .filter(|header| !header.is_empty())
        .map(|header| (header.clone(), String::new()))
        .collect()
}

/// Converts a stored 1-based index into a 0-based position.
fn to_position(index: i64) -> Result<usize> {
    let index = usize::try_from(index).with_context(|| format!("invalid stored index: {index}"))?;
    index
        .checked_sub(1)
        .ok_or_else(|| anyhow!("invalid stored index: {index}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
