//! Run configuration from the environment plus the report registry.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adsync_core::{AccountId, DateWindow};
use adsync_reporting::ReportRequest;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::destination::validate_table_name;

pub const DEFAULT_START_DATE: &str = "2026-01-01";
pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com";
pub const DEFAULT_GRAPH_API_VERSION: &str = "v18.0";

/// Built once at entry and passed down by reference.
#[derive(Clone)]
pub struct SyncConfig {
    pub access_token: String,
    pub database_url: Option<String>,
    pub accounts: Vec<AccountId>,
    pub window: DateWindow,
    pub graph_api_base: String,
    pub graph_api_version: String,
    pub page_limit: u32,
    pub page_delay: Duration,
    pub poll_timeout: Duration,
    pub http_timeout_secs: u64,
    pub requests_per_minute: Option<u32>,
    pub user_agent: String,
    pub workspace_root: PathBuf,
    pub skip_partial_writes: bool,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("access_token", &"***")
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("accounts", &self.accounts)
            .field("window", &self.window)
            .field("graph_api_base", &self.graph_api_base)
            .field("graph_api_version", &self.graph_api_version)
            .field("page_limit", &self.page_limit)
            .field("page_delay", &self.page_delay)
            .field("poll_timeout", &self.poll_timeout)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("user_agent", &self.user_agent)
            .field("workspace_root", &self.workspace_root)
            .field("skip_partial_writes", &self.skip_partial_writes)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str, default: u64| -> Result<u64> {
            match var(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
                None => Ok(default),
            }
        };

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let start = var("START_DATE").unwrap_or_else(|| DEFAULT_START_DATE.to_string());
        let end = var("END_DATE").unwrap_or(today);
        let window = DateWindow::parse(&start, &end).context("invalid START_DATE/END_DATE window")?;

        let accounts: Vec<AccountId> = var("AD_ACCOUNT_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(AccountId::new)
                    .collect()
            })
            .unwrap_or_default();

        let page_limit = u32::try_from(parsed("ADSYNC_PAGE_LIMIT", 500)?)
            .context("ADSYNC_PAGE_LIMIT out of range")?;
        let requests_per_minute = match var("ADSYNC_REQUESTS_PER_MINUTE") {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .with_context(|| format!("ADSYNC_REQUESTS_PER_MINUTE must be an integer, got {raw:?}"))?,
            ),
            None => None,
        };

        Ok(Self {
            access_token: var("ACCESS_TOKEN").unwrap_or_default(),
            database_url: var("DATABASE_URL").or_else(|| var("NEON_CONNECTION_STRING")),
            accounts,
            window,
            graph_api_base: var("GRAPH_API_BASE").unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string()),
            graph_api_version: var("GRAPH_API_VERSION")
                .unwrap_or_else(|| DEFAULT_GRAPH_API_VERSION.to_string()),
            page_limit,
            page_delay: Duration::from_millis(parsed("ADSYNC_PAGE_DELAY_MS", 1000)?),
            poll_timeout: Duration::from_secs(parsed("ADSYNC_POLL_TIMEOUT_SECS", 30 * 60)?),
            http_timeout_secs: parsed("ADSYNC_HTTP_TIMEOUT_SECS", 60)?,
            requests_per_minute,
            user_agent: var("ADSYNC_USER_AGENT").unwrap_or_else(|| "adsync/0.1".to_string()),
            workspace_root: var("ADSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            skip_partial_writes: var("ADSYNC_SKIP_PARTIAL_WRITES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
        })
    }

    /// Fetching needs a credential and at least one account.
    pub fn ensure_fetch_ready(&self) -> Result<()> {
        anyhow::ensure!(!self.access_token.is_empty(), "ACCESS_TOKEN is not set");
        anyhow::ensure!(!self.accounts.is_empty(), "AD_ACCOUNT_IDS lists no accounts");
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL (or NEON_CONNECTION_STRING) is not set")
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportConfig {
    pub name: String,
    pub table: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub breakdowns: Vec<String>,
    #[serde(default)]
    pub extra_fields: Vec<String>,
}

impl ReportConfig {
    fn new(name: &str, table: &str, breakdowns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            enabled: true,
            breakdowns: breakdowns.iter().map(|b| b.to_string()).collect(),
            extra_fields: Vec::new(),
        }
    }

    pub fn request(&self, window: DateWindow) -> ReportRequest {
        ReportRequest::new(window)
            .with_breakdowns(self.breakdowns.iter().cloned())
            .with_extra_fields(self.extra_fields.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportRegistry {
    pub reports: Vec<ReportConfig>,
}

impl ReportRegistry {
    pub fn builtin() -> Self {
        Self {
            reports: vec![
                ReportConfig::new("summary", "meta_ads_summary", &[]),
                ReportConfig::new("age_gender", "meta_ads_age_gender", &["age", "gender"]),
                ReportConfig::new("region", "meta_ads_region", &["region"]),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// `reports.yaml` under the workspace root when present, builtin registry otherwise.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("reports.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for report in &self.reports {
            anyhow::ensure!(names.insert(&report.name), "duplicate report name {:?}", report.name);
            validate_table_name(&report.table)?;
        }
        Ok(())
    }

    /// Enabled reports, narrowed to `only` when it is non-empty.
    pub fn selected(&self, only: &[String]) -> Result<Vec<&ReportConfig>> {
        if let Some(unknown) = only.iter().find(|n| !self.reports.iter().any(|r| &r.name == *n)) {
            anyhow::bail!("unknown report {unknown:?}");
        }
        Ok(self
            .reports
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| only.is_empty() || only.contains(&r.name))
            .collect())
    }

    pub fn tables(&self) -> Vec<String> {
        self.reports
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.table.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn config_reads_accounts_window_and_fallback_database() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("ACCESS_TOKEN", "secret"),
            ("NEON_CONNECTION_STRING", "postgres://neon/db"),
            ("AD_ACCOUNT_IDS", "act_1, act_2,,"),
            ("START_DATE", "2026-01-01"),
            ("END_DATE", "2026-01-31"),
            ("ADSYNC_SKIP_PARTIAL_WRITES", "true"),
        ]))
        .unwrap();
        assert_eq!(config.accounts, vec![AccountId::new("act_1"), AccountId::new("act_2")]);
        assert_eq!(config.window, DateWindow::parse("2026-01-01", "2026-01-31").unwrap());
        assert_eq!(config.require_database_url().unwrap(), "postgres://neon/db");
        assert_eq!(config.page_limit, 500);
        assert_eq!(config.poll_timeout, Duration::from_secs(1800));
        assert!(config.skip_partial_writes);
        assert!(config.ensure_fetch_ready().is_ok());
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn config_rejects_bad_numbers_and_windows() {
        assert!(SyncConfig::from_lookup(lookup(&[("ADSYNC_PAGE_LIMIT", "lots")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[
            ("START_DATE", "2026-02-01"),
            ("END_DATE", "2026-01-01")
        ]))
        .is_err());
        let empty = SyncConfig::from_lookup(lookup(&[("END_DATE", "2026-03-01")])).unwrap();
        assert!(empty.ensure_fetch_ready().is_err());
        assert!(empty.require_database_url().is_err());
    }

    #[test]
    fn builtin_registry_has_three_variants() {
        let registry = ReportRegistry::builtin();
        assert_eq!(
            registry.tables(),
            vec!["meta_ads_summary", "meta_ads_age_gender", "meta_ads_region"]
        );
        let selected = registry.selected(&["region".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].breakdowns, vec!["region"]);
        assert!(registry.selected(&["nope".to_string()]).is_err());
    }

    #[test]
    fn registry_yaml_validates_tables() {
        let registry = ReportRegistry::from_yaml_str(
            "reports:\n  - name: device\n    table: meta_ads_device\n    breakdowns: [device_platform]\n    extra_fields: [inline_link_clicks]\n  - name: off\n    table: meta_ads_off\n    enabled: false\n",
        )
        .unwrap();
        assert_eq!(registry.tables(), vec!["meta_ads_device"]);
        let window = DateWindow::parse("2026-01-01", "2026-01-02").unwrap();
        let request = registry.reports[0].request(window);
        assert_eq!(request.breakdowns, vec!["device_platform"]);
        assert!(request.fields.iter().any(|f| f == "inline_link_clicks"));

        assert!(ReportRegistry::from_yaml_str("reports:\n  - name: x\n    table: \"Bad Name\"\n").is_err());
    }
}
