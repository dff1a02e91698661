//! Postgres destination over a `sqlx` pool.

use std::collections::HashSet;

use adsync_core::{DateWindow, FlatRow, Scalar};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use crate::destination::{
    quote_ident, validate_table_name, ColumnInfo, Destination, DestinationError, WindowWrite,
    DATE_COLUMN, TEXT_TYPE,
};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_000;

const TABLE_EXISTS_SQL: &str = "SELECT to_regclass(quote_ident($1)) IS NOT NULL";

const TABLE_COLUMNS_SQL: &str = r#"
    SELECT a.attname::text AS name,
           format_type(a.atttypid, a.atttypmod) AS sql_type
      FROM pg_attribute a
     WHERE a.attrelid = to_regclass(quote_ident($1))
       AND a.attnum > 0
       AND NOT a.attisdropped
     ORDER BY a.attnum
"#;

const TABLE_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

#[derive(Debug, Clone)]
pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to destination database")?;
        Ok(Self::new(pool))
    }

    async fn begin_locked(&self, table: &str) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(TABLE_LOCK_SQL)
            .bind(table)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

pub fn add_column_sql(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {TEXT_TYPE}",
        quote_ident(table),
        quote_ident(column)
    )
}

pub fn create_table_sql(table: &str, shape: &[ColumnInfo]) -> String {
    let columns = shape
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quote_ident(table))
}

/// Compares the first ten characters so date and timestamp columns behave alike.
pub fn delete_window_sql(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE LEFT(CAST({} AS TEXT), 10) BETWEEN $1 AND $2",
        quote_ident(table),
        quote_ident(DATE_COLUMN)
    )
}

/// Multi-row insert binding every value as text, cast to the column's type.
pub fn insert_sql(table: &str, columns: &[ColumnInfo], row_count: usize) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut param = 0usize;
    let tuples = (0..row_count)
        .map(|_| {
            let cells = columns
                .iter()
                .map(|c| {
                    param += 1;
                    format!("CAST(${param} AS {})", c.sql_type)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({cells})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({names}) VALUES {tuples}", quote_ident(table))
}

pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

/// Destination columns that the batch actually uses; row columns the table lacks are reported separately.
fn insert_columns(table_columns: &[ColumnInfo], rows: &[FlatRow]) -> (Vec<ColumnInfo>, Vec<String>) {
    let present: HashSet<&str> = rows.iter().flat_map(|row| row.columns()).collect();
    let known: HashSet<&str> = table_columns.iter().map(|c| c.name.as_str()).collect();
    let used = table_columns
        .iter()
        .filter(|c| present.contains(c.name.as_str()))
        .cloned()
        .collect();
    let mut missing = present
        .into_iter()
        .filter(|c| !known.contains(c))
        .map(str::to_string)
        .collect::<Vec<_>>();
    missing.sort();
    (used, missing)
}

async fn introspect(
    executor: &mut sqlx::PgConnection,
    table: &str,
) -> Result<Vec<ColumnInfo>, sqlx::Error> {
    let rows = sqlx::query(TABLE_COLUMNS_SQL)
        .bind(table)
        .fetch_all(executor)
        .await?;
    rows.iter()
        .map(|row| -> Result<ColumnInfo, sqlx::Error> {
            Ok(ColumnInfo::new(
                row.try_get::<String, _>("name")?,
                row.try_get::<String, _>("sql_type")?,
            ))
        })
        .collect()
}

async fn delete_window(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    window: &DateWindow,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&delete_window_sql(table))
        .bind(window.since())
        .bind(window.until())
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

async fn insert_rows(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    table_columns: &[ColumnInfo],
    rows: &[FlatRow],
) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let (columns, missing) = insert_columns(table_columns, rows);
    if !missing.is_empty() {
        warn!(table, columns = ?missing, "destination lacks columns; their values are not written");
    }
    if columns.is_empty() {
        return Ok(0);
    }

    let mut inserted = 0u64;
    for chunk in rows.chunks(rows_per_statement(columns.len())) {
        let sql = insert_sql(table, &columns, chunk.len());
        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in &columns {
                query = query.bind(row.get(&column.name).and_then(Scalar::render));
            }
        }
        inserted += query.execute(&mut **tx).await?.rows_affected();
        debug!(table, rows = chunk.len(), "inserted chunk");
    }
    Ok(inserted)
}

#[async_trait]
impl Destination for PgDestination {
    async fn table_exists(&self, table: &str) -> Result<bool, DestinationError> {
        validate_table_name(table)?;
        sqlx::query_scalar::<_, bool>(TABLE_EXISTS_SQL)
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| DestinationError::Introspect {
                table: table.to_string(),
                message: err.to_string(),
            })
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DestinationError> {
        validate_table_name(table)?;
        let introspect_err = |err: sqlx::Error| DestinationError::Introspect {
            table: table.to_string(),
            message: err.to_string(),
        };
        let mut conn = self.pool.acquire().await.map_err(introspect_err)?;
        introspect(&mut conn, table).await.map_err(introspect_err)
    }

    async fn add_column(&self, table: &str, column: &str) -> Result<(), DestinationError> {
        validate_table_name(table)?;
        sqlx::query(&add_column_sql(table, column))
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| DestinationError::SchemaAlter {
                table: table.to_string(),
                column: column.to_string(),
                message: err.to_string(),
            })
    }

    async fn create_table_with_rows(
        &self,
        table: &str,
        shape: &[ColumnInfo],
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError> {
        validate_table_name(table)?;
        let create_err = |err: sqlx::Error| DestinationError::Create {
            table: table.to_string(),
            message: err.to_string(),
        };

        let mut tx = self.begin_locked(table).await.map_err(create_err)?;
        sqlx::query(&create_table_sql(table, shape))
            .execute(&mut *tx)
            .await
            .map_err(create_err)?;
        // Another process may have created the table first; honour its column types.
        let columns = introspect(&mut tx, table).await.map_err(create_err)?;
        let deleted = delete_window(&mut tx, table, window).await.map_err(create_err)?;
        let inserted = insert_rows(&mut tx, table, &columns, rows)
            .await
            .map_err(create_err)?;
        tx.commit().await.map_err(create_err)?;

        info!(table, columns = columns.len(), inserted, "created table from row shape");
        Ok(WindowWrite { deleted, inserted })
    }

    async fn replace_window(
        &self,
        table: &str,
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError> {
        validate_table_name(table)?;
        let write_err = |err: sqlx::Error| DestinationError::WriteTransaction {
            table: table.to_string(),
            window: *window,
            message: err.to_string(),
        };

        // Dropping the transaction without commit rolls it back.
        let mut tx = self.begin_locked(table).await.map_err(write_err)?;
        let columns = introspect(&mut tx, table).await.map_err(write_err)?;
        let deleted = delete_window(&mut tx, table, window).await.map_err(write_err)?;
        let inserted = insert_rows(&mut tx, table, &columns, rows)
            .await
            .map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;

        Ok(WindowWrite { deleted, inserted })
    }
}
