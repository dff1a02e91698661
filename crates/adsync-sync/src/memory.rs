//! In-process destination used by `--dry-run` and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use adsync_core::{DateWindow, FlatRow};
use async_trait::async_trait;

use crate::destination::{row_in_window, ColumnInfo, Destination, DestinationError, WindowWrite};

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<FlatRow>,
}

impl MemoryTable {
    fn replace(&mut self, window: &DateWindow, rows: &[FlatRow]) -> WindowWrite {
        let before = self.rows.len();
        self.rows.retain(|row| !row_in_window(row, window));
        let deleted = (before - self.rows.len()) as u64;
        let projected = rows.iter().map(|row| self.project(row)).collect::<Vec<_>>();
        self.rows.extend(projected);
        WindowWrite {
            deleted,
            inserted: rows.len() as u64,
        }
    }

    /// Keeps only columns the table has, like an insert naming existing columns.
    fn project(&self, row: &FlatRow) -> FlatRow {
        self.columns
            .iter()
            .filter_map(|c| row.get(&c.name).map(|v| (c.name.clone(), v.clone())))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    failing_columns: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    write_calls: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, columns: Vec<ColumnInfo>, rows: Vec<FlatRow>) -> Self {
        {
            let mut tables = self.lock_tables();
            let mut seeded = MemoryTable {
                columns,
                rows: Vec::new(),
            };
            seeded.rows = rows.iter().map(|row| seeded.project(row)).collect();
            tables.insert(table.to_string(), seeded);
        }
        self
    }

    /// Every later attempt to add `column` fails.
    pub fn fail_column(&self, column: &str) {
        self.failing_columns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(column.to_string());
    }

    /// While set, writes fail after doing nothing.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: &str) -> Vec<FlatRow> {
        self.lock_tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.lock_tables()
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock_tables().keys().cloned().collect()
    }

    fn lock_tables(&self) -> MutexGuard<'_, BTreeMap<String, MemoryTable>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_write(&self, table: &str, window: &DateWindow) -> Result<(), DestinationError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DestinationError::WriteTransaction {
                table: table.to_string(),
                window: *window,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn table_exists(&self, table: &str) -> Result<bool, DestinationError> {
        Ok(self.lock_tables().contains_key(table))
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DestinationError> {
        Ok(self
            .lock_tables()
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn add_column(&self, table: &str, column: &str) -> Result<(), DestinationError> {
        let failing = self
            .failing_columns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(column);
        if failing {
            return Err(DestinationError::SchemaAlter {
                table: table.to_string(),
                column: column.to_string(),
                message: "injected alter failure".to_string(),
            });
        }
        let mut tables = self.lock_tables();
        let Some(existing) = tables.get_mut(table) else {
            return Err(DestinationError::SchemaAlter {
                table: table.to_string(),
                column: column.to_string(),
                message: "table does not exist".to_string(),
            });
        };
        if !existing.columns.iter().any(|c| c.name == column) {
            existing.columns.push(ColumnInfo::text(column));
        }
        Ok(())
    }

    async fn create_table_with_rows(
        &self,
        table: &str,
        shape: &[ColumnInfo],
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError> {
        self.begin_write(table, window)?;
        let mut tables = self.lock_tables();
        let target = tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            columns: shape.to_vec(),
            rows: Vec::new(),
        });
        Ok(target.replace(window, rows))
    }

    async fn replace_window(
        &self,
        table: &str,
        window: &DateWindow,
        rows: &[FlatRow],
    ) -> Result<WindowWrite, DestinationError> {
        self.begin_write(table, window)?;
        let mut tables = self.lock_tables();
        let Some(target) = tables.get_mut(table) else {
            return Err(DestinationError::WriteTransaction {
                table: table.to_string(),
                window: *window,
                message: "table does not exist".to_string(),
            });
        };
        Ok(target.replace(window, rows))
    }
}
