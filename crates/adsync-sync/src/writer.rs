//! Window-scoped idempotent upsert with per-table serialization.

use std::collections::HashMap;
use std::sync::Arc;

use adsync_core::{DateWindow, FlatRow};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::destination::{
    infer_shape, row_in_window, validate_table_name, Destination, DestinationError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub created: bool,
    pub deleted: u64,
    pub inserted: u64,
    /// Rows dropped because their date falls outside the window or is missing.
    pub rejected: usize,
}

pub struct UpsertWriter {
    destination: Arc<dyn Destination>,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UpsertWriter {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self {
            destination,
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut map = self.table_locks.lock().await;
        map.entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Replaces the window's rows with `rows`, creating the table from their shape
    /// when it does not exist. Writes to one table never interleave.
    pub async fn write(
        &self,
        table: &str,
        rows: &[FlatRow],
        window: &DateWindow,
    ) -> Result<WriteOutcome, DestinationError> {
        validate_table_name(table)?;

        let (in_window, rejected): (Vec<&FlatRow>, Vec<&FlatRow>) =
            rows.iter().partition(|row| row_in_window(row, window));
        if !rejected.is_empty() {
            warn!(table, %window, rejected = rejected.len(), "rows dated outside the window are not written");
        }
        let rows = in_window.into_iter().cloned().collect::<Vec<_>>();
        if rows.is_empty() {
            // Replacing a window with nothing would erase history on a provider outage.
            warn!(table, %window, "no rows to write; destination left untouched");
            return Ok(WriteOutcome {
                rejected: rejected.len(),
                ..Default::default()
            });
        }

        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        let mut outcome = WriteOutcome {
            rejected: rejected.len(),
            ..Default::default()
        };
        let write = if self.destination.table_exists(table).await? {
            self.destination.replace_window(table, window, &rows).await?
        } else {
            outcome.created = true;
            let shape = infer_shape(&rows);
            self.destination
                .create_table_with_rows(table, &shape, window, &rows)
                .await?
        };
        outcome.deleted = write.deleted;
        outcome.inserted = write.inserted;

        info!(
            table,
            %window,
            created = outcome.created,
            deleted = outcome.deleted,
            inserted = outcome.inserted,
            "window replaced"
        );
        Ok(outcome)
    }
}
