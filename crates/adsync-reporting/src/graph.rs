//! Graph insights endpoints: async report runs plus cursor-paginated results.

use std::sync::Arc;

use adsync_core::{AccountId, JobStatus, RawInsightRow, ReportJob};
use adsync_http::{redact_url, FetchError, HttpFetcher};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::{InsightPage, PageCursor, ReportRequest, ReportingApi, ReportingError, StatusSnapshot};

#[derive(Debug, Clone)]
pub struct GraphApiConfig {
    pub base_url: String,
    pub version: String,
    pub access_token: String,
    pub page_limit: u32,
}

impl GraphApiConfig {
    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.version.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub struct GraphReportingApi {
    http: Arc<HttpFetcher>,
    config: GraphApiConfig,
    run_id: Uuid,
}

impl GraphReportingApi {
    pub fn new(http: Arc<HttpFetcher>, config: GraphApiConfig, run_id: Uuid) -> Self {
        Self {
            http,
            config,
            run_id,
        }
    }

    fn token_query(&self) -> (&'static str, String) {
        ("access_token", self.config.access_token.clone())
    }
}

#[async_trait]
impl ReportingApi for GraphReportingApi {
    async fn submit(
        &self,
        account: &AccountId,
        request: &ReportRequest,
    ) -> Result<String, ReportingError> {
        let url = self.config.endpoint(&format!("{account}/insights"));
        let query = submit_query(request, self.config.page_limit, self.token_query());
        let response = self
            .http
            .post_json(self.run_id, account.as_str(), &url, &query)
            .await
            .map_err(|err| ReportingError::Submission {
                account: account.clone(),
                message: provider_message(&err),
            })?;
        parse_submit_body(&response.body).ok_or_else(|| ReportingError::Submission {
            account: account.clone(),
            message: response.body.to_string(),
        })
    }

    async fn status(&self, job: &ReportJob) -> Result<StatusSnapshot, ReportingError> {
        let url = self.config.endpoint(&job.job_id);
        let response = self
            .http
            .get_json(self.run_id, job.account.as_str(), &url, &[self.token_query()])
            .await?;
        Ok(parse_status_body(&response.body))
    }

    async fn page(
        &self,
        job: &ReportJob,
        cursor: Option<&PageCursor>,
    ) -> Result<InsightPage, ReportingError> {
        let response = match cursor {
            // The continuation URL already carries the credential and paging parameters.
            Some(next) => {
                debug!(cursor = %redact_url(next.as_str()), "following page cursor");
                self.http
                    .get_json(self.run_id, job.account.as_str(), next.as_str(), &[])
                    .await?
            }
            None => {
                let url = self.config.endpoint(&format!("{}/insights", job.job_id));
                let query = [
                    self.token_query(),
                    ("limit", self.config.page_limit.to_string()),
                ];
                self.http
                    .get_json(self.run_id, job.account.as_str(), &url, &query)
                    .await?
            }
        };
        parse_page_body(&response.body)
    }
}

pub fn submit_query(
    request: &ReportRequest,
    page_limit: u32,
    token: (&'static str, String),
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("level", request.level.clone()),
        ("time_increment", request.time_increment.to_string()),
        ("fields", request.fields.join(",")),
        (
            "time_range",
            json!({ "since": request.window.since(), "until": request.window.until() }).to_string(),
        ),
        ("limit", page_limit.to_string()),
    ];
    if !request.breakdowns.is_empty() {
        query.push(("breakdowns", request.breakdowns.join(",")));
    }
    query.push(token);
    query
}

pub fn parse_submit_body(body: &JsonValue) -> Option<String> {
    match body.get("report_run_id")? {
        JsonValue::String(id) if !id.is_empty() => Some(id.clone()),
        JsonValue::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn parse_async_status(raw: &str) -> JobStatus {
    match raw {
        "Job Not Started" => JobStatus::Pending,
        "Job Completed" => JobStatus::Completed,
        "Job Failed" => JobStatus::Failed,
        "Job Skipped" => JobStatus::Skipped,
        // "Job Started", "Job Running" and anything new keep the poll loop going.
        _ => JobStatus::Running,
    }
}

pub fn parse_status_body(body: &JsonValue) -> StatusSnapshot {
    let status = body
        .get("async_status")
        .and_then(JsonValue::as_str)
        .map(parse_async_status)
        .unwrap_or(JobStatus::Running);
    let percent_complete = body
        .get("async_percent_completion")
        .and_then(JsonValue::as_f64)
        .map(|p| p.clamp(0.0, 100.0) as u32)
        .unwrap_or(0);
    StatusSnapshot {
        status,
        percent_complete,
    }
}

pub fn parse_page_body(body: &JsonValue) -> Result<InsightPage, ReportingError> {
    let Some(data) = body.get("data").and_then(JsonValue::as_array) else {
        return Err(ReportingError::InvalidResponse {
            context: "insights page",
            body: excerpt(body),
        });
    };
    let rows = data
        .iter()
        .cloned()
        .filter_map(RawInsightRow::from_value)
        .collect();
    let next = body
        .get("paging")
        .and_then(|p| p.get("next"))
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(PageCursor::new);
    Ok(InsightPage { rows, next })
}

/// Prefers the provider's `error.message` over the raw transport error text.
fn provider_message(err: &FetchError) -> String {
    err.body()
        .and_then(|body| serde_json::from_str::<JsonValue>(body).ok())
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| err.to_string())
}

fn excerpt(body: &JsonValue) -> String {
    let text = body.to_string();
    redact_url(&text).chars().take(512).collect()
}
