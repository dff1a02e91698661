//! SQL destination seam: introspection, column growth and window replacement.

use std::collections::BTreeMap;

use adsync_core::{DateWindow, FlatRow, Scalar};
use async_trait::async_trait;
use thiserror::Error;

/// Column holding the row's report date; window replacement keys on it.
pub const DATE_COLUMN: &str = "date_start";

pub const TEXT_TYPE: &str = "TEXT";
pub const NUMERIC_TYPE: &str = "DOUBLE PRECISION";

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("invalid table name {0:?}: expected [a-z0-9_]+")]
    InvalidTable(String),
    #[error("introspecting {table}: {message}")]
    Introspect { table: String, message: String },
    #[error("adding column {column} to {table}: {message}")]
    SchemaAlter {
        table: String,
        column: String,
        message: String,
    },
    #[error("creating {table}: {message}")]
    Create { table: String, message: String },
    #[error("replacing window {window} of {table} failed and was rolled back: {message}")]
    WriteTransaction {
        table: String,
        window: DateWindow,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, TEXT_TYPE)
    }
}

/// Counts reported by one window replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowWrite {
    pub deleted: u64,
    pub inserted: u64,
}

/// Column set and types inferred from a batch of rows. A column is numeric when it
/// holds at least one number and no text; all-absent columns stay text.
pub fn infer_shape(rows: &[FlatRow]) -> Vec<ColumnInfo> {
    #[derive(Default)]
    struct Seen {
        number: bool,
        text: bool,
    }

    let mut seen: BTreeMap<&str, Seen> = BTreeMap::new();
    for row in rows {
        for (column, value) in row.iter() {
            let entry = seen.entry(column).or_default();
            match value {
                Scalar::Number(_) => entry.number = true,
                Scalar::Text(_) => entry.text = true,
                Scalar::Absent => {}
            }
        }
    }
    seen.into_iter()
        .map(|(column, seen)| {
            // The window key stays text so date comparisons behave the same everywhere.
            let sql_type = if seen.number && !seen.text && column != DATE_COLUMN {
                NUMERIC_TYPE
            } else {
                TEXT_TYPE
            };
            ColumnInfo::new(column, sql_type)
        })
        .collect()
}

/// Whether the row's `date_start` falls inside the window. Undated rows never do.
pub fn row_in_window(row: &FlatRow, window: &DateWindow) -> bool {
    row.get(DATE_COLUMN)
        .and_then(Scalar::render)
        .is_some_and(|date| window.contains_str(&date))
}

/// Union of column names across rows, sorted.
pub fn required_columns(rows: &[FlatRow]) -> Vec<String> {
    let mut columns = rows
        .iter()
        .flat_map(|row| row.columns().map(str::to_string))
        .collect::<Vec<_>>();
    columns.sort();
    columns.dedup();
    columns
}

pub fn validate_table_name(table: &str) -> Result<(), DestinationError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DestinationError::InvalidTable(table.to_string()))
    }
}

/// Double-quoted SQL identifier with embedded quotes escaped.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Everything the pipeline needs from a SQL-capable store. `replace_window` and
/// `create_table_with_rows` are atomic: on error the destination is unchanged.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, DestinationError>;

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DestinationError>;

    /// Adds one text column.
    async fn add_column(&self, table: &str, column: &str) -> Result<(), DestinationError>;

    async fn create_table_with_rows(
        &self,
        table: &str,
        shape: &[ColumnInfo],
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError>;

    /// Deletes every row dated inside `window`, then inserts `rows`, in one transaction.
    async fn replace_window(
        &self,
        table: &str,
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError>;
}
