//! Reporting API contracts and asynchronous report-job orchestration.

use std::time::Duration;

use adsync_core::{AccountId, DateWindow, JobStatus, RawInsightRow, ReportJob};
use adsync_http::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod graph;
pub mod orchestrator;

pub use graph::{GraphApiConfig, GraphReportingApi};
pub use orchestrator::{
    AccountOutcome, AccountRun, FetchOutcome, OrchestratorConfig, PageStream, PollSchedule,
    ReportOrchestrator,
};

pub const CRATE_NAME: &str = "adsync-reporting";

/// Fields requested for every report unless a report overrides them.
pub const DEFAULT_FIELDS: &[&str] = &[
    "campaign_id",
    "campaign_name",
    "adset_id",
    "adset_name",
    "ad_id",
    "ad_name",
    "objective",
    "impressions",
    "reach",
    "frequency",
    "clicks",
    "ctr",
    "cpc",
    "cpm",
    "spend",
    "actions",
    "action_values",
    "cost_per_action_type",
    "purchase_roas",
    "results",
    "cost_per_result",
    "date_start",
    "date_stop",
    "catalog_segment_actions",
    "catalog_segment_value",
    "catalog_segment_value_mobile_purchase_roas",
    "catalog_segment_value_omni_purchase_roas",
    "catalog_segment_value_website_purchase_roas",
    // Catalog segments are suppressed once breakdowns apply, so each is requested explicitly.
    "omni_purchase_catalog",
    "omni_purchase_catalog_value",
    "purchase_catalog",
    "purchase_catalog_value",
    "offsite_conversion_fb_pixel_purchase_catalog",
    "offsite_conversion_fb_pixel_purchase_catalog_value",
    "onsite_app_purchase_catalog",
    "onsite_app_purchase_catalog_value",
    "app_custom_event_fb_mobile_purchase_catalog",
    "app_custom_event_fb_mobile_purchase_catalog_value",
];

/// What to ask the provider for: one report definition applied to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub fields: Vec<String>,
    pub breakdowns: Vec<String>,
    pub window: DateWindow,
    pub level: String,
    pub time_increment: u32,
}

impl ReportRequest {
    pub fn new(window: DateWindow) -> Self {
        Self {
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            breakdowns: Vec::new(),
            window,
            level: "ad".to_string(),
            time_increment: 1,
        }
    }

    pub fn with_breakdowns<I, S>(mut self, breakdowns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.breakdowns = breakdowns.into_iter().map(Into::into).collect();
        self
    }

    /// Appends fields not already requested.
    pub fn with_extra_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub percent_complete: u32,
}

/// Opaque continuation token handed back with each results page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsightPage {
    pub rows: Vec<RawInsightRow>,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error("report submission rejected for {account}: {message}")]
    Submission { account: AccountId, message: String },
    #[error("report job {job_id} not finished after {waited:?}")]
    PollTimeout { job_id: String, waited: Duration },
    #[error("report job {job_id} ended with status {status}")]
    JobFailed { job_id: String, status: JobStatus },
    #[error("fetching page {page} of job {job_id} failed: {message}")]
    PageFetch {
        job_id: String,
        page: usize,
        message: String,
    },
    #[error("unexpected response for {context}: {body}")]
    InvalidResponse { context: &'static str, body: String },
    #[error("account task aborted: {0}")]
    Task(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
}

/// Seam to the remote reporting service. One implementation talks HTTP, tests script it.
#[async_trait]
pub trait ReportingApi: Send + Sync {
    async fn submit(
        &self,
        account: &AccountId,
        request: &ReportRequest,
    ) -> Result<String, ReportingError>;

    async fn status(&self, job: &ReportJob) -> Result<StatusSnapshot, ReportingError>;

    async fn page(
        &self,
        job: &ReportJob,
        cursor: Option<&PageCursor>,
    ) -> Result<InsightPage, ReportingError>;
}
