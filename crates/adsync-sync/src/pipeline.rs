//! One run: fetch every selected report for every account, flatten, extend the
//! destination schema, then replace the window.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adsync_core::{DateWindow, FlatRow, RawInsightRow};
use adsync_http::{HttpClientConfig, HttpFetcher, TokenBucketConfig};
use adsync_normalize::{Flattener, NormalizationRules};
use adsync_reporting::graph::parse_page_body;
use adsync_reporting::{
    AccountRun, GraphApiConfig, GraphReportingApi, OrchestratorConfig, PollSchedule,
    ReportOrchestrator, ReportingApi,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ReportConfig, ReportRegistry, SyncConfig};
use crate::destination::{required_columns, Destination, DestinationError};
use crate::memory::MemoryDestination;
use crate::postgres::PgDestination;
use crate::quality::QualitySummary;
use crate::schema::{sync_schema_preset, KnownColumns, SchemaSyncReport, SchemaSynchronizer};
use crate::writer::{UpsertWriter, WriteOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account: String,
    pub job_id: Option<String>,
    pub outcome: String,
    pub rows: usize,
    pub pages: usize,
    pub error: Option<String>,
}

impl From<&AccountRun> for AccountSummary {
    fn from(run: &AccountRun) -> Self {
        Self {
            account: run.account.to_string(),
            job_id: run.job.as_ref().map(|job| job.job_id.clone()),
            outcome: format!("{:?}", run.outcome),
            rows: run.rows.len(),
            pages: run.pages,
            error: run.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoRows,
    PartialData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRunSummary {
    pub report: String,
    pub table: String,
    pub accounts: Vec<AccountSummary>,
    pub rows: usize,
    /// Some account failed, timed out or returned a truncated page sequence.
    pub partial: bool,
    pub quality: QualitySummary,
    pub schema: Option<SchemaSyncReport>,
    pub write: Option<WriteOutcome>,
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
}

impl ReportRunSummary {
    fn new(report: &ReportConfig) -> Self {
        Self {
            report: report.name.clone(),
            table: report.table.clone(),
            accounts: Vec::new(),
            rows: 0,
            partial: false,
            quality: QualitySummary::default(),
            schema: None,
            write: None,
            skipped: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DateWindow,
    pub reports: Vec<ReportRunSummary>,
}

impl SyncRunSummary {
    /// Tables whose schema sync or write failed this run.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.table.as_str())
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        self.reports.iter().any(|r| r.partial)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: ReportRegistry,
    run_id: Uuid,
    orchestrator: Arc<ReportOrchestrator>,
    flattener: Flattener,
    schema: SchemaSynchronizer,
    writer: UpsertWriter,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: ReportRegistry,
        api: Arc<dyn ReportingApi>,
        destination: Arc<dyn Destination>,
        rules: NormalizationRules,
    ) -> Self {
        let orchestrator = ReportOrchestrator::new(
            api,
            OrchestratorConfig {
                poll: PollSchedule {
                    timeout: config.poll_timeout,
                    ..Default::default()
                },
                page_delay: config.page_delay,
            },
        );
        Self {
            config,
            registry,
            run_id: Uuid::new_v4(),
            orchestrator: Arc::new(orchestrator),
            flattener: Flattener::new(rules),
            schema: SchemaSynchronizer::new(Arc::clone(&destination)),
            writer: UpsertWriter::new(destination),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Runs every enabled report, or only those named in `only`. Reports run one
    /// after another; accounts inside a report run concurrently.
    pub async fn run_once(&self, only: &[String]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let reports = self.registry.selected(only)?;
        info!(
            run_id = %self.run_id,
            window = %self.config.window,
            accounts = self.config.accounts.len(),
            reports = reports.len(),
            "sync run started"
        );

        let mut summaries = Vec::with_capacity(reports.len());
        for report in reports {
            let span = info_span!("report", report = %report.name, table = %report.table);
            summaries.push(self.run_report(report).instrument(span).await);
        }

        let summary = SyncRunSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            window: self.config.window,
            reports: summaries,
        };
        info!(
            run_id = %summary.run_id,
            partial = summary.is_partial(),
            failed_tables = ?summary.failed_tables(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_report(&self, report: &ReportConfig) -> ReportRunSummary {
        let mut summary = ReportRunSummary::new(report);
        let request = report.request(self.config.window);

        let runs = self
            .orchestrator
            .run_accounts(&self.config.accounts, &request)
            .await;
        summary.accounts = runs.iter().map(AccountSummary::from).collect();
        summary.partial = runs.iter().any(|run| !run.is_complete());

        let raw = runs.into_iter().flat_map(|run| run.rows).collect::<Vec<_>>();
        let rows = self.flattener.flatten_all(raw);
        summary.rows = rows.len();
        summary.quality = QualitySummary::from_rows(
            &rows,
            &report.breakdowns,
            &self.flattener.rules().purchase_value_columns,
        );
        summary.quality.log(&report.table);

        if rows.is_empty() {
            warn!(table = %report.table, "no rows fetched; write skipped");
            summary.skipped = Some(SkipReason::NoRows);
            return summary;
        }
        if summary.partial && self.config.skip_partial_writes {
            warn!(table = %report.table, rows = rows.len(), "partial data; write skipped by policy");
            summary.skipped = Some(SkipReason::PartialData);
            return summary;
        }
        if summary.partial {
            warn!(table = %report.table, rows = rows.len(), "writing partial data");
        }

        match self.persist(&report.table, &rows).await {
            Ok((schema, write)) => {
                summary.schema = Some(schema);
                summary.write = Some(write);
            }
            Err(err) => {
                error!(table = %report.table, error = %err, "destination write failed");
                summary.error = Some(err.to_string());
            }
        }
        summary
    }

    async fn persist(
        &self,
        table: &str,
        rows: &[FlatRow],
    ) -> Result<(SchemaSyncReport, WriteOutcome), DestinationError> {
        let schema = self.schema.sync(table, required_columns(rows)).await?;
        let write = self.writer.write(table, rows, &self.config.window).await?;
        Ok((schema, write))
    }
}

/// Graph-backed reporting API with the transport limits from `config`.
pub fn build_graph_api(config: &SyncConfig, run_id: Uuid) -> Result<GraphReportingApi> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.requests_per_minute.map(TokenBucketConfig::per_minute),
        ..Default::default()
    })?;
    Ok(GraphReportingApi::new(
        Arc::new(http),
        GraphApiConfig {
            base_url: config.graph_api_base.clone(),
            version: config.graph_api_version.clone(),
            access_token: config.access_token.clone(),
            page_limit: config.page_limit,
        },
        run_id,
    ))
}

/// Loads rules and registry from the workspace root, then runs once. `dry_run`
/// writes into an in-memory destination instead of the database.
pub async fn run_sync_once_from_env(only: &[String], dry_run: bool) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    config.ensure_fetch_ready()?;
    let registry = ReportRegistry::from_workspace_root(&config.workspace_root)?;
    let rules = NormalizationRules::from_workspace_root(&config.workspace_root)
        .context("loading normalization rules")?;

    let destination: Arc<dyn Destination> = if dry_run {
        info!("dry run: writing to an in-memory destination");
        Arc::new(MemoryDestination::new())
    } else {
        Arc::new(PgDestination::connect(config.require_database_url()?).await?)
    };

    let run_id = Uuid::new_v4();
    let api = Arc::new(build_graph_api(&config, run_id)?);
    let pipeline =
        SyncPipeline::new(config, registry, api, destination, rules).with_run_id(run_id);
    pipeline.run_once(only).await
}

/// Extends every enabled report table with the known-column preset.
pub async fn run_sync_schema_from_env() -> Result<Vec<SchemaSyncReport>> {
    let config = SyncConfig::from_env()?;
    let registry = ReportRegistry::from_workspace_root(&config.workspace_root)?;
    let preset = KnownColumns::from_workspace_root(&config.workspace_root)?;
    let destination = PgDestination::connect(config.require_database_url()?).await?;
    let synchronizer = SchemaSynchronizer::new(Arc::new(destination));
    sync_schema_preset(&synchronizer, &registry.tables(), &preset).await
}

/// Reads a saved insights page: either a full `{ "data": [...] }` body or a bare array of rows.
pub fn load_saved_page(path: &Path) -> Result<Vec<RawInsightRow>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let body: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if let JsonValue::Array(items) = body {
        return Ok(items.into_iter().filter_map(RawInsightRow::from_value).collect());
    }
    let page = parse_page_body(&body).with_context(|| format!("reading rows from {}", path.display()))?;
    Ok(page.rows)
}
