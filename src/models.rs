//! Data model (§3): `ScheduleEntry`, `JobTemplate`, `JobRun`,
//! `AdvancedScheduleConfig` and their nested types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ValidationError;

/// Supported export output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Ovf,
    Ova,
    Qcow2,
    Vmdk,
    Raw,
}

/// Credentials attached to a job template.
///
/// The password field is kept out of `Debug`/`Display` output so templates
/// can be logged safely; callers that need the raw value use
/// [`Credentials::expose_password`].
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the raw password. Named distinctly from a getter to make
    /// call sites that leak it grep-able.
    pub fn expose_password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Free-form metadata value used by the carbon gate and observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            MetaValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// The declarative job definition passed to a provider for one export.
///
/// Immutable once passed into a run (§3 JobTemplate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: String,
    pub name: String,
    pub vm_id: String,
    pub destination: String,
    pub format: ExportFormat,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub metadata: HashMap<String, MetaValue>,
}

impl JobTemplate {
    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(MetaValue::as_bool)
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetaValue::as_f64)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_str)
    }
}

/// Status of a [`JobRun`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobRunStatus::Completed | JobRunStatus::Failed | JobRunStatus::Cancelled
        )
    }
}

/// Progress of an in-flight run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: String,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub percent: f64,
    pub eta: Option<DateTime<Utc>>,
}

/// An instance of a [`JobTemplate`] being executed (§3 JobRun).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub template: JobTemplate,
    pub status: JobRunStatus,
    pub progress: JobProgress,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    pub fn new_pending(run_id: String, template: JobTemplate, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            template,
            status: JobRunStatus::Pending,
            progress: JobProgress::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a strictly-forward status transition. Returns `false` (and
    /// leaves state unchanged) if `to` would move out of a terminal state.
    pub fn transition(&mut self, to: JobRunStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        self.updated_at = now;
        true
    }
}

/// Required state a dependency must have reached (§3/§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredState {
    Completed,
    Failed,
    Any,
}

/// One entry of `AdvancedScheduleConfig.DependsOn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySpec {
    pub job_id: String,
    pub required_state: RequiredState,
    /// 0 = no timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
}

/// Backoff growth strategy (§4.G / GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Fibonacci,
    #[default]
    Constant,
}

/// Retry policy (§3 AdvancedScheduleConfig.RetryPolicy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: std::time::Duration,
    pub strategy: BackoffStrategy,
    /// Substring patterns; retry only fires when one matches the error text.
    /// Empty means "retry on any error".
    #[serde(default)]
    pub retry_on_errors: Vec<String>,
}

impl RetryPolicy {
    /// Generic backoff helper for callers that don't go through
    /// `RetryManager`. Uses the same `fib(attempt)` convention as
    /// `RetryManager::calculate_backoff` — see SPEC_FULL.md §5 Open
    /// Question 1 for why these are kept aligned rather than divergent.
    pub fn calculate_backoff(&self, attempt: u32) -> std::time::Duration {
        crate::retry::calculate_backoff(self, attempt)
    }
}

/// A weekday, used by `TimeWindow.daysOfWeek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<chrono::Weekday> for Weekday {
    fn from(w: chrono::Weekday) -> Self {
        match w {
            chrono::Weekday::Mon => Weekday::Mon,
            chrono::Weekday::Tue => Weekday::Tue,
            chrono::Weekday::Wed => Weekday::Wed,
            chrono::Weekday::Thu => Weekday::Thu,
            chrono::Weekday::Fri => Weekday::Fri,
            chrono::Weekday::Sat => Weekday::Sat,
            chrono::Weekday::Sun => Weekday::Sun,
        }
    }
}

/// A weekly recurring allowed execution interval in a named timezone
/// (§4.H, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// "HH:MM", 24-hour.
    pub start_hhmm: String,
    /// "HH:MM", 24-hour.
    pub end_hhmm: String,
    pub days_of_week: Vec<Weekday>,
    pub iana_timezone: String,
}

impl TimeWindow {
    /// Validate at schedule-insert time, per §4.H / §7.
    pub fn validate(&self) -> Result<(), ValidationError> {
        parse_hhmm(&self.start_hhmm)?;
        parse_hhmm(&self.end_hhmm)?;
        if self.days_of_week.is_empty() {
            return Err(ValidationError::EmptyDaysOfWeek);
        }
        crate::clock::load_location(&self.iana_timezone)
            .map_err(|_| ValidationError::InvalidTimezone(self.iana_timezone.clone()))?;
        Ok(())
    }
}

pub(crate) fn parse_hhmm(s: &str) -> Result<(u32, u32), ValidationError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| ValidationError::InvalidTime(s.to_string()))?;
    let h: u32 = h.parse().map_err(|_| ValidationError::InvalidTime(s.to_string()))?;
    let m: u32 = m.parse().map_err(|_| ValidationError::InvalidTime(s.to_string()))?;
    if h > 23 || m > 59 {
        return Err(ValidationError::InvalidTime(s.to_string()));
    }
    Ok((h, m))
}

/// A condition type pluggable into `AdvancedScheduleConfig.Conditions`
/// (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub operator: String,
    pub value: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Advanced per-schedule configuration (§3 AdvancedScheduleConfig).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvancedScheduleConfig {
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub skip_if_running: bool,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
}

impl AdvancedScheduleConfig {
    /// Validate every nested piece per §7 (synchronous, at schedule-insert
    /// time). Does NOT check dependency cycles — that is a whole-table
    /// check performed by `SchedulerCore::add_scheduled_job`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.priority > 100 {
            return Err(ValidationError::PriorityOutOfRange(self.priority));
        }
        for window in &self.time_windows {
            window.validate()?;
        }
        Ok(())
    }
}

/// A recurring schedule template (§3 ScheduleEntry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 5- or 6-field cron expression, UTC.
    pub schedule: String,
    pub job_template: JobTemplate,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Derived; refreshed after any enable/update (invariant in §3).
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub advanced_config: Option<AdvancedScheduleConfig>,
}

impl ScheduleEntry {
    pub fn priority(&self) -> u8 {
        self.advanced_config.as_ref().map(|c| c.priority).unwrap_or(0)
    }
}

/// Per-job-ID dependency bookkeeping entry (§3 JobState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub state: RequiredState,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A single retry history entry (§3 RetryAttempt.history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub delay: std::time::Duration,
}

/// Per-job-ID retry bookkeeping (§3 RetryAttempt).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub last_error: Option<String>,
    pub next_retry: Option<DateTime<Utc>>,
    pub history: Vec<RetryHistoryEntry>,
}

/// Carbon intensity reading for one zone (§3 CarbonIntensity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonIntensity {
    pub zone: String,
    pub intensity_gco2_per_kwh: f64,
    pub fossil_free_percent: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// A short forecast point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub intensity_gco2_per_kwh: f64,
}

/// Current grid status for a zone (§3 GridStatus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridStatus {
    pub current: CarbonIntensity,
    pub optimal_for_backup: bool,
    pub next_optimal_time: Option<DateTime<Utc>>,
    pub forecast: Vec<ForecastPoint>,
}
