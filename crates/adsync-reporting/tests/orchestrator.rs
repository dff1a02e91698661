use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adsync_core::{AccountId, DateWindow, JobStatus, RawInsightRow, ReportJob};
use adsync_reporting::{
    AccountOutcome, InsightPage, OrchestratorConfig, PageCursor, PollSchedule, ReportOrchestrator,
    ReportRequest, ReportingApi, ReportingError, StatusSnapshot,
};
use async_trait::async_trait;
use serde_json::json;

#[derive(Default)]
struct AccountScript {
    reject_submit: bool,
    statuses: VecDeque<JobStatus>,
    pages: VecDeque<Result<InsightPage, String>>,
}

#[derive(Default)]
struct ScriptedApi {
    scripts: Mutex<HashMap<String, AccountScript>>,
    status_calls: Mutex<usize>,
    page_calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedApi {
    fn with_account(self, account: &str, script: AccountScript) -> Self {
        self.scripts.lock().unwrap().insert(account.to_string(), script);
        self
    }

    fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap()
    }

    fn page_cursors(&self) -> Vec<Option<String>> {
        self.page_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportingApi for ScriptedApi {
    async fn submit(
        &self,
        account: &AccountId,
        _request: &ReportRequest,
    ) -> Result<String, ReportingError> {
        let scripts = self.scripts.lock().unwrap();
        let script = scripts.get(account.as_str()).expect("scripted account");
        if script.reject_submit {
            return Err(ReportingError::Submission {
                account: account.clone(),
                message: "(#100) invalid parameter".into(),
            });
        }
        Ok(format!("job-{account}"))
    }

    async fn status(&self, job: &ReportJob) -> Result<StatusSnapshot, ReportingError> {
        *self.status_calls.lock().unwrap() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(job.account.as_str()).expect("scripted account");
        // The last scripted status repeats forever.
        let status = if script.statuses.len() > 1 {
            script.statuses.pop_front().unwrap()
        } else {
            *script.statuses.front().unwrap_or(&JobStatus::Running)
        };
        Ok(StatusSnapshot {
            status,
            percent_complete: if status == JobStatus::Completed { 100 } else { 50 },
        })
    }

    async fn page(
        &self,
        job: &ReportJob,
        cursor: Option<&PageCursor>,
    ) -> Result<InsightPage, ReportingError> {
        self.page_calls
            .lock()
            .unwrap()
            .push(cursor.map(|c| c.as_str().to_string()));
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(job.account.as_str()).expect("scripted account");
        match script.pages.pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(message)) => Err(ReportingError::InvalidResponse {
                context: "insights page",
                body: message,
            }),
            None => Ok(InsightPage::default()),
        }
    }
}

fn rows(count: usize, prefix: &str) -> Vec<RawInsightRow> {
    (0..count)
        .map(|i| {
            RawInsightRow::from_value(json!({
                "ad_id": format!("{prefix}-{i}"),
                "date_start": "2026-01-05",
            }))
            .unwrap()
        })
        .collect()
}

fn page(count: usize, prefix: &str, next: Option<&str>) -> Result<InsightPage, String> {
    Ok(InsightPage {
        rows: rows(count, prefix),
        next: next.map(PageCursor::new),
    })
}

fn request() -> ReportRequest {
    ReportRequest::new(DateWindow::parse("2026-01-01", "2026-01-31").unwrap())
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll: PollSchedule {
            initial: Duration::from_secs(10),
            step: Duration::from_secs(5),
            max: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        },
        page_delay: Duration::ZERO,
    }
}

fn completed_script(pages: Vec<Result<InsightPage, String>>) -> AccountScript {
    AccountScript {
        statuses: VecDeque::from([JobStatus::Running, JobStatus::Completed]),
        pages: VecDeque::from(pages),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn pagination_follows_cursor_until_exhausted() {
    let api = Arc::new(ScriptedApi::default().with_account(
        "act_1",
        completed_script(vec![page(50, "p1", Some("c1")), page(30, "p2", None)]),
    ));
    let orchestrator = ReportOrchestrator::new(api.clone(), fast_config());
    let job = ReportJob::submitted("job-act_1", AccountId::new("act_1"), chrono::Utc::now());

    let outcome = orchestrator.fetch(&job).collect().await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.rows.len(), 80);
    assert_eq!(outcome.pages, 2);
    assert_eq!(api.page_cursors(), vec![None, Some("c1".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn failed_page_keeps_rows_already_collected() {
    let api = Arc::new(ScriptedApi::default().with_account(
        "act_1",
        completed_script(vec![
            page(50, "p1", Some("c1")),
            Err("upstream 500".to_string()),
            page(30, "never", None),
        ]),
    ));
    let orchestrator = Arc::new(ReportOrchestrator::new(api.clone(), fast_config()));

    let run = orchestrator
        .run_account(&AccountId::new("act_1"), &request())
        .await;

    assert_eq!(run.outcome, AccountOutcome::Partial);
    assert_eq!(run.rows.len(), 50);
    assert!(matches!(
        run.error,
        Some(ReportingError::PageFetch { page: 2, .. })
    ));
    assert_eq!(api.page_cursors().len(), 2);
    assert!(run
        .rows
        .iter()
        .all(|row| row.str_field("account_id") == Some("act_1")));
}

#[tokio::test(start_paused = true)]
async fn polling_backs_off_until_terminal() {
    let api = Arc::new(ScriptedApi::default().with_account(
        "act_1",
        AccountScript {
            statuses: VecDeque::from([
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
            ]),
            ..Default::default()
        },
    ));
    let orchestrator = ReportOrchestrator::new(api.clone(), fast_config());
    let mut job = ReportJob::submitted("job-act_1", AccountId::new("act_1"), chrono::Utc::now());

    let started = tokio::time::Instant::now();
    let status = orchestrator.poll(&mut job).await;

    assert_eq!(status, JobStatus::Completed);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.percent_complete, 100);
    assert_eq!(api.status_calls(), 3);
    // 10s after the first poll, then 15s after the second.
    assert_eq!(started.elapsed(), Duration::from_secs(25));
}

#[tokio::test(start_paused = true)]
async fn polling_gives_up_locally_at_timeout() {
    let api = Arc::new(ScriptedApi::default().with_account(
        "act_1",
        AccountScript {
            statuses: VecDeque::from([JobStatus::Running]),
            ..Default::default()
        },
    ));
    let orchestrator = ReportOrchestrator::new(api.clone(), fast_config());
    let mut job = ReportJob::submitted("job-act_1", AccountId::new("act_1"), chrono::Utc::now());

    let status = orchestrator.poll(&mut job).await;

    assert_eq!(status, JobStatus::TimedOut);
    // Polls at 0s, 10s, 25s, 45s and the clamped final poll at 60s.
    assert_eq!(api.status_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn accounts_fail_independently() {
    let api = Arc::new(
        ScriptedApi::default()
            .with_account(
                "act_rejected",
                AccountScript {
                    reject_submit: true,
                    ..Default::default()
                },
            )
            .with_account(
                "act_failed",
                AccountScript {
                    statuses: VecDeque::from([JobStatus::Running, JobStatus::Failed]),
                    ..Default::default()
                },
            )
            .with_account("act_ok", completed_script(vec![page(3, "ok", None)])),
    );
    let orchestrator = Arc::new(ReportOrchestrator::new(api, fast_config()));
    let accounts = [
        AccountId::new("act_rejected"),
        AccountId::new("act_failed"),
        AccountId::new("act_ok"),
    ];

    let runs = orchestrator.run_accounts(&accounts, &request()).await;

    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].outcome, AccountOutcome::SubmissionFailed);
    assert!(runs[0].job.is_none());
    assert_eq!(runs[1].outcome, AccountOutcome::JobFailed(JobStatus::Failed));
    assert!(runs[1].rows.is_empty());
    assert!(runs[2].is_complete());
    assert_eq!(runs[2].rows.len(), 3);
    assert_eq!(runs[2].account.as_str(), "act_ok");
}

#[tokio::test(start_paused = true)]
async fn account_that_never_finishes_times_out_without_rows() {
    let api = Arc::new(
        ScriptedApi::default()
            .with_account(
                "act_slow",
                AccountScript {
                    statuses: VecDeque::from([JobStatus::Pending, JobStatus::Running]),
                    pages: VecDeque::from([page(5, "late", None)]),
                    ..Default::default()
                },
            )
            .with_account("act_ok", completed_script(vec![page(2, "ok", None)])),
    );
    let orchestrator = Arc::new(ReportOrchestrator::new(api.clone(), fast_config()));
    let accounts = [AccountId::new("act_slow"), AccountId::new("act_ok")];

    let runs = orchestrator.run_accounts(&accounts, &request()).await;

    assert_eq!(runs[0].outcome, AccountOutcome::TimedOut);
    assert!(!runs[0].is_complete());
    assert!(runs[0].rows.is_empty());
    assert_eq!(runs[0].job.as_ref().map(|job| job.status), Some(JobStatus::TimedOut));
    assert!(matches!(
        &runs[0].error,
        Some(ReportingError::PollTimeout { job_id, waited })
            if job_id == "job-act_slow" && *waited == Duration::from_secs(60)
    ));
    assert!(runs[1].is_complete());
    assert_eq!(runs[1].rows.len(), 2);
    // Only the completed account's job was paged.
    assert_eq!(api.page_cursors(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn fetch_restarts_from_first_page_each_invocation() {
    let api = Arc::new(ScriptedApi::default().with_account(
        "act_1",
        completed_script(vec![
            page(2, "a", Some("c1")),
            page(1, "b", None),
            page(2, "a", Some("c1")),
            page(1, "b", None),
        ]),
    ));
    let orchestrator = ReportOrchestrator::new(api.clone(), fast_config());
    let job = ReportJob::submitted("job-act_1", AccountId::new("act_1"), chrono::Utc::now());

    let first = orchestrator.fetch(&job).collect().await;
    let second = orchestrator.fetch(&job).collect().await;

    assert_eq!(first.rows.len(), 3);
    assert_eq!(second.rows.len(), 3);
    assert_eq!(
        api.page_cursors(),
        vec![None, Some("c1".into()), None, Some("c1".into())]
    );
}
