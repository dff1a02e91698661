//! Extends destination tables so every required column exists.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::destination::{Destination, DestinationError};

const BUILTIN_KNOWN_COLUMNS: &str = include_str!("../schema/known_columns.yaml");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSyncReport {
    pub table: String,
    pub table_existed: bool,
    pub added: Vec<String>,
    /// Columns that could not be added, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SchemaSyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.failed.is_empty()
    }
}

pub struct SchemaSynchronizer {
    destination: Arc<dyn Destination>,
}

impl SchemaSynchronizer {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    /// Adds each missing column as text. A table that does not exist yet is left
    /// for the writer to create; a column that fails to add is logged and skipped.
    pub async fn sync<I, S>(&self, table: &str, required: I) -> Result<SchemaSyncReport, DestinationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = SchemaSyncReport {
            table: table.to_string(),
            ..Default::default()
        };
        if !self.destination.table_exists(table).await? {
            info!(table, "table does not exist yet; schema sync deferred to creation");
            return Ok(report);
        }
        report.table_existed = true;

        let existing: HashSet<String> = self
            .destination
            .table_columns(table)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut seen = HashSet::new();
        let missing = required
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .filter(|c| !existing.contains(c) && seen.insert(c.clone()))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            info!(table, "no missing columns");
            return Ok(report);
        }

        info!(table, missing = missing.len(), "adding missing columns");
        for column in missing {
            match self.destination.add_column(table, &column).await {
                Ok(()) => report.added.push(column),
                Err(err) => {
                    warn!(table, %column, error = %err, "failed to add column; continuing");
                    report.failed.push((column, err.to_string()));
                }
            }
        }
        info!(table, added = report.added.len(), failed = report.failed.len(), "schema sync finished");
        Ok(report)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct KnownColumnsFile {
    version: u32,
    groups: BTreeMap<String, Vec<String>>,
}

/// Column preset applied by `sync-schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownColumns {
    pub columns: Vec<String>,
}

impl KnownColumns {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_KNOWN_COLUMNS).context("parsing builtin schema/known_columns.yaml")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: KnownColumnsFile = serde_yaml::from_str(text)?;
        anyhow::ensure!(file.version == 1, "unsupported known-columns version {}", file.version);
        let mut seen = HashSet::new();
        let columns = file
            .groups
            .into_values()
            .flatten()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        Ok(Self { columns })
    }

    /// `schema/known_columns.yaml` under the workspace root when present, builtin otherwise.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("schema").join("known_columns.yaml");
        if !path.exists() {
            return Self::builtin();
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Applies the preset to every table; missing tables are reported, not created.
pub async fn sync_schema_preset(
    synchronizer: &SchemaSynchronizer,
    tables: &[String],
    preset: &KnownColumns,
) -> Result<Vec<SchemaSyncReport>> {
    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        let report = synchronizer
            .sync(table, &preset.columns)
            .await
            .with_context(|| format!("syncing schema of {table}"))?;
        if !report.table_existed {
            warn!(%table, "table does not exist; skipped");
        }
        reports.push(report);
    }
    Ok(reports)
}
