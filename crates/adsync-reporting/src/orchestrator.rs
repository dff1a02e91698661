//! Per-account report lifecycle: submit, poll to a terminal status, then page through results.

use std::sync::Arc;
use std::time::Duration;

use adsync_core::{AccountId, JobStatus, RawInsightRow, ReportJob};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{PageCursor, ReportRequest, ReportingApi, ReportingError};

/// Poll interval grows linearly by `step` from `initial` up to `max`; polling gives up after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            step: Duration::from_secs(5),
            max: Duration::from_secs(30),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PollSchedule {
    pub fn interval_for(&self, poll_index: u32) -> Duration {
        self.initial
            .saturating_add(self.step.saturating_mul(poll_index))
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub poll: PollSchedule,
    /// Courtesy pause between consecutive page requests.
    pub page_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll: PollSchedule::default(),
            page_delay: Duration::from_secs(1),
        }
    }
}

/// Rows gathered by one pass over a job's pages. A failed page ends the pass but keeps earlier rows.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub rows: Vec<RawInsightRow>,
    pub pages: usize,
    pub error: Option<ReportingError>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Lazy page sequence for one job. Each call to [`ReportOrchestrator::fetch`] starts from the first page.
pub struct PageStream<'a> {
    api: &'a dyn ReportingApi,
    job: &'a ReportJob,
    page_delay: Duration,
    cursor: Option<PageCursor>,
    pages: usize,
    done: bool,
}

impl<'a> PageStream<'a> {
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub async fn next_page(&mut self) -> Option<Result<Vec<RawInsightRow>, ReportingError>> {
        if self.done {
            return None;
        }
        if self.pages > 0 && !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        match self.api.page(self.job, self.cursor.as_ref()).await {
            Ok(page) => {
                self.pages += 1;
                if page.next.is_some() && page.next == self.cursor {
                    warn!(job_id = %self.job.job_id, page = self.pages, "provider repeated page cursor; stopping");
                    self.done = true;
                } else {
                    self.done = page.next.is_none();
                }
                self.cursor = page.next;
                Some(Ok(page.rows))
            }
            Err(err) => {
                self.done = true;
                Some(Err(ReportingError::PageFetch {
                    job_id: self.job.job_id.clone(),
                    page: self.pages + 1,
                    message: err.to_string(),
                }))
            }
        }
    }

    pub async fn collect(mut self) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        while let Some(page) = self.next_page().await {
            match page {
                Ok(rows) => {
                    outcome.rows.extend(rows);
                    info!(
                        job_id = %self.job.job_id,
                        page = self.pages,
                        total_rows = outcome.rows.len(),
                        "fetched insights page"
                    );
                }
                Err(err) => {
                    warn!(job_id = %self.job.job_id, error = %err, rows_kept = outcome.rows.len(), "page fetch failed; keeping partial rows");
                    outcome.error = Some(err);
                }
            }
        }
        outcome.pages = self.pages;
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOutcome {
    Complete,
    /// Job completed but the page sequence was cut short.
    Partial,
    SubmissionFailed,
    JobFailed(JobStatus),
    TimedOut,
    /// The account task panicked or was cancelled.
    Aborted,
}

/// Everything one account produced in one run.
#[derive(Debug)]
pub struct AccountRun {
    pub account: AccountId,
    pub job: Option<ReportJob>,
    pub outcome: AccountOutcome,
    pub rows: Vec<RawInsightRow>,
    pub pages: usize,
    pub error: Option<ReportingError>,
}

impl AccountRun {
    fn without_rows(account: AccountId, job: Option<ReportJob>, outcome: AccountOutcome, error: ReportingError) -> Self {
        Self {
            account,
            job,
            outcome,
            rows: Vec::new(),
            pages: 0,
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == AccountOutcome::Complete
    }
}

pub struct ReportOrchestrator {
    api: Arc<dyn ReportingApi>,
    config: OrchestratorConfig,
}

impl ReportOrchestrator {
    pub fn new(api: Arc<dyn ReportingApi>, config: OrchestratorConfig) -> Self {
        Self { api, config }
    }

    pub async fn submit(
        &self,
        account: &AccountId,
        request: &ReportRequest,
    ) -> Result<ReportJob, ReportingError> {
        let job_id = self.api.submit(account, request).await?;
        info!(%account, %job_id, "report job created");
        Ok(ReportJob::submitted(job_id, account.clone(), Utc::now()))
    }

    /// Blocks until the job reaches a terminal status. Giving up yields `TimedOut`
    /// locally; the remote job is left running and may still complete.
    pub async fn poll(&self, job: &mut ReportJob) -> JobStatus {
        let schedule = self.config.poll;
        let started = Instant::now();
        let mut poll_index = 0u32;

        loop {
            match self.api.status(job).await {
                Ok(snapshot) => {
                    job.status = snapshot.status;
                    job.percent_complete = snapshot.percent_complete;
                    info!(
                        job_id = %job.job_id,
                        status = %job.status,
                        percent = job.percent_complete,
                        elapsed_secs = started.elapsed().as_secs(),
                        "polled report job"
                    );
                    if job.status.is_terminal() {
                        return job.status;
                    }
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "status poll failed; will retry");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= schedule.timeout {
                warn!(job_id = %job.job_id, waited_secs = elapsed.as_secs(), "report job timed out locally");
                job.status = JobStatus::TimedOut;
                return job.status;
            }
            let wait = schedule.interval_for(poll_index).min(schedule.timeout - elapsed);
            tokio::time::sleep(wait).await;
            poll_index = poll_index.saturating_add(1);
        }
    }

    pub fn fetch<'a>(&'a self, job: &'a ReportJob) -> PageStream<'a> {
        PageStream {
            api: self.api.as_ref(),
            job,
            page_delay: self.config.page_delay,
            cursor: None,
            pages: 0,
            done: false,
        }
    }

    /// Submit, poll and fetch for one account. Every row is tagged with `account_id`.
    pub async fn run_account(&self, account: &AccountId, request: &ReportRequest) -> AccountRun {
        let mut job = match self.submit(account, request).await {
            Ok(job) => job,
            Err(err) => {
                error!(%account, error = %err, "report submission failed; skipping account");
                return AccountRun::without_rows(account.clone(), None, AccountOutcome::SubmissionFailed, err);
            }
        };

        let status = self.poll(&mut job).await;
        match status {
            JobStatus::Completed => {}
            JobStatus::TimedOut => {
                let err = ReportingError::PollTimeout {
                    job_id: job.job_id.clone(),
                    waited: self.config.poll.timeout,
                };
                return AccountRun::without_rows(account.clone(), Some(job), AccountOutcome::TimedOut, err);
            }
            other => {
                error!(%account, job_id = %job.job_id, status = %other, "report job did not complete");
                let err = ReportingError::JobFailed {
                    job_id: job.job_id.clone(),
                    status: other,
                };
                return AccountRun::without_rows(account.clone(), Some(job), AccountOutcome::JobFailed(other), err);
            }
        }

        let mut fetched = self.fetch(&job).collect().await;
        for row in &mut fetched.rows {
            row.insert("account_id", JsonValue::String(account.to_string()));
        }
        let outcome = if fetched.is_complete() {
            AccountOutcome::Complete
        } else {
            AccountOutcome::Partial
        };
        info!(%account, rows = fetched.rows.len(), pages = fetched.pages, ?outcome, "account fetch finished");

        AccountRun {
            account: account.clone(),
            job: Some(job),
            outcome,
            rows: fetched.rows,
            pages: fetched.pages,
            error: fetched.error,
        }
    }

    /// Runs every account concurrently; one account's failure never affects another.
    /// Results come back in input order.
    pub async fn run_accounts(
        self: &Arc<Self>,
        accounts: &[AccountId],
        request: &ReportRequest,
    ) -> Vec<AccountRun> {
        let handles = accounts
            .iter()
            .map(|account| {
                let this = Arc::clone(self);
                let request = request.clone();
                let task_account = account.clone();
                let span = info_span!("account_run", account = %account);
                let handle = tokio::spawn(
                    async move { this.run_account(&task_account, &request).await }.instrument(span),
                );
                (account.clone(), handle)
            })
            .collect::<Vec<_>>();

        let mut runs = Vec::with_capacity(handles.len());
        for (account, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(join_err) => {
                    error!(%account, error = %join_err, "account task aborted");
                    runs.push(AccountRun::without_rows(
                        account,
                        None,
                        AccountOutcome::Aborted,
                        ReportingError::Task(join_err.to_string()),
                    ));
                }
            }
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_steps_up_to_cap() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.interval_for(0), Duration::from_secs(10));
        assert_eq!(schedule.interval_for(1), Duration::from_secs(15));
        assert_eq!(schedule.interval_for(3), Duration::from_secs(25));
        assert_eq!(schedule.interval_for(4), Duration::from_secs(30));
        assert_eq!(schedule.interval_for(500), Duration::from_secs(30));
    }
}
