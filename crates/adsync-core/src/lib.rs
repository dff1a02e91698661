//! Core domain model shared by the reporting, normalization and sync stages.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "adsync-core";

/// Opaque advertising account identifier (`act_...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote asynchronous report run. Created by submission, mutated only by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub job_id: String,
    pub account: AccountId,
    pub status: JobStatus,
    pub percent_complete: u32,
    pub submitted_at: DateTime<Utc>,
}

impl ReportJob {
    pub fn submitted(job_id: impl Into<String>, account: AccountId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            account,
            status: JobStatus::Pending,
            percent_complete: 0,
            submitted_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
    #[error("invalid date {value:?}: {source}")]
    Parse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Inclusive date range whose destination rows are replaced on each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, WindowError> {
        Self::new(parse_iso_date(start)?, parse_iso_date(end)?)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Accepts `YYYY-MM-DD` optionally followed by a time component.
    pub fn contains_str(&self, value: &str) -> bool {
        let head = value.trim().get(..10).unwrap_or_default();
        NaiveDate::parse_from_str(head, "%Y-%m-%d")
            .map(|date| self.contains(date))
            .unwrap_or(false)
    }

    pub fn since(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn until(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.since(), self.until())
    }
}

fn parse_iso_date(value: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|source| WindowError::Parse {
        value: value.to_string(),
        source,
    })
}

/// Lenient numeric coercion: unparsable, missing or non-finite values become `0.0`.
pub fn coerce_number(value: &JsonValue) -> f64 {
    parse_number(value).unwrap_or(0.0)
}

fn parse_number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Column-safe name: `.` and anything outside `[A-Za-z0-9_]` become `_`.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Scalar cell of a flat row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
    #[default]
    Absent,
}

impl Scalar {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Absent,
            JsonValue::Bool(b) => Self::Text(b.to_string()),
            JsonValue::Number(n) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .map(Self::Number)
                .unwrap_or(Self::Absent),
            JsonValue::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) if v.is_finite() => Some(*v),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn coerce_f64(&self) -> f64 {
        self.as_f64().unwrap_or(0.0)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// Text rendering used when binding into a text-typed destination.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Number(v) => Some(v.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Absent => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else {
            Self::Number(0.0)
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Flattened report row: column name -> scalar, no nested values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRow(BTreeMap<String, Scalar>);

impl FlatRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }

    /// Present and not absent.
    pub fn has_value(&self, column: &str) -> bool {
        self.get(column).is_some_and(|v| !v.is_absent())
    }

    pub fn number(&self, column: &str) -> f64 {
        self.get(column).map(Scalar::coerce_f64).unwrap_or(0.0)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Scalar::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Scalar> {
        self.0.remove(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Scalar)> for FlatRow {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Nested insights row as returned by the reporting API. Consumed once by flattening.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawInsightRow(JsonMap<String, JsonValue>);

impl RawInsightRow {
    pub fn new(fields: JsonMap<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// `None` unless the value is a JSON object.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(JsonValue::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> JsonMap<String, JsonValue> {
        self.0
    }
}

/// One `{action_type, value}` entry of an action-style array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub action_type: String,
    pub value: f64,
}

impl ActionEntry {
    pub fn new(action_type: impl Into<String>, value: f64) -> Self {
        Self {
            action_type: action_type.into(),
            value,
        }
    }

    /// Entries without a string `action_type` are unusable and yield `None`;
    /// a malformed `value` degrades to `0.0`.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let action_type = value.get("action_type")?.as_str()?;
        Some(Self {
            action_type: action_type.to_string(),
            value: value.get("value").map(coerce_number).unwrap_or(0.0),
        })
    }

    pub fn list_from_json(value: Option<&JsonValue>) -> Vec<Self> {
        value
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().filter_map(Self::from_json).collect())
            .unwrap_or_default()
    }
}

/// Provider pre-aggregated result entry (`results` field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeResult {
    pub indicator: Option<String>,
    /// First reported value; `None` when the entry carries no values.
    pub value: Option<f64>,
}

impl NativeResult {
    pub fn new(indicator: Option<&str>, value: Option<f64>) -> Self {
        Self {
            indicator: indicator.map(str::to_string),
            value,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        let indicator = value
            .get("indicator")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let first = value
            .get("values")
            .and_then(JsonValue::as_array)
            .and_then(|values| values.first())
            .and_then(|entry| entry.get("value"))
            .map(coerce_number);
        Self {
            indicator,
            value: first,
        }
    }

    pub fn list_from_json(value: Option<&JsonValue>) -> Vec<Self> {
        value
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(Self::from_json).collect())
            .unwrap_or_default()
    }

    /// Action type named by the indicator tag, e.g. `actions:omni_purchase` -> `omni_purchase`.
    pub fn action_type(&self) -> Option<&str> {
        let indicator = self.indicator.as_deref()?;
        Some(indicator.split_once(':').map(|(_, t)| t).unwrap_or(indicator))
    }
}
