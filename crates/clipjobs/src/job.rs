//! Job data model shared by the store, the orchestrator and observers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ─── Status ─────────────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// States from which `self` can be entered.
    pub fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[],
            JobStatus::Running => &[JobStatus::Queued],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Running],
            JobStatus::Cancelled => &[JobStatus::Queued, JobStatus::Running],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown value '{0}'")]
pub struct UnknownValue(pub String);

impl FromStr for JobStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownValue(s.to_string()))
    }
}

// ─── Log lines ──────────────────────────────────────────────────────────────

/// Severity of a persisted log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// One line of a job's persisted log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogLine {
    /// Store-assigned sequence number.
    pub seq: i64,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// ─── Errors carried on failed jobs ──────────────────────────────────────────

/// Machine-checkable reason codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    StoreUnavailable,
    SpawnError,
    ProcessExitError,
    ParseError,
    NotFound,
    Cancelled,
    InvalidTransition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::SpawnError => "SPAWN_ERROR",
            ErrorKind::ProcessExitError => "PROCESS_EXIT_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload stored on a failed or cancelled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: ErrorKind,
    /// Exit code as a string for non-zero exits, otherwise a symbolic code.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Path to the on-disk transcript of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl JobFailure {
    /// Creates a failure whose code is the kind itself.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.as_str().to_string(),
            message: message.into(),
            exit_code: None,
            log_file: None,
        }
    }

    /// Worker terminated with a non-zero exit code.
    pub fn exit_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ProcessExitError,
            code: code.to_string(),
            message: message.into(),
            exit_code: Some(code),
            log_file: None,
        }
    }

    /// Error payload recorded when a job is cancelled.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Job was cancelled")
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_log_file(mut self, log_file: Option<&str>) -> Self {
        self.log_file = log_file.map(|s| s.to_string());
        self
    }
}

// ─── Progress ───────────────────────────────────────────────────────────────

/// Field-merged progress record of a job.
///
/// Always carries `percent` and `steps`; other keys come from the worker's
/// `[PROGRESS]` payloads. Merging replaces whole top-level values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobProgress(Map<String, Value>);

impl Default for JobProgress {
    fn default() -> Self {
        let mut map = Map::new();
        map.insert("percent".to_string(), Value::from(0));
        map.insert("steps".to_string(), Value::Array(Vec::new()));
        Self(map)
    }
}

impl JobProgress {
    /// Builds a record from a stored map, filling in missing required keys.
    pub fn from_map(map: Map<String, Value>) -> Self {
        let mut progress = Self::default();
        progress.merge(&map);
        progress
    }

    pub fn percent(&self) -> Option<f64> {
        self.0.get("percent").and_then(Value::as_f64)
    }

    pub fn steps(&self) -> Vec<String> {
        match self.0.get("steps") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Shallow merge: every key in `patch` overwrites the current value.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn push_step(&mut self, step: &str) {
        match self.0.get_mut("steps") {
            Some(Value::Array(items)) => items.push(Value::from(step)),
            _ => {
                self.0
                    .insert("steps".to_string(), Value::Array(vec![Value::from(step)]));
            }
        }
    }

    pub fn set_percent(&mut self, percent: f64) {
        self.0.insert("percent".to_string(), number_value(percent));
    }

    /// Records frame counters and derives the percentage from them.
    pub fn set_frame(&mut self, current: u64, total: u64) {
        self.0
            .insert("currentFrame".to_string(), Value::from(current));
        self.0.insert("totalFrames".to_string(), Value::from(total));
        if total > 0 {
            self.set_percent((current as f64 * 100.0 / total as f64).round());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Whole numbers serialize as JSON integers so `50` stays `50`, not `50.0`.
fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ─── Result ─────────────────────────────────────────────────────────────────

/// A clip produced by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRef {
    pub name: String,
    pub path: String,
}

impl ClipRef {
    /// Builds a reference whose name is the file name of `path`.
    pub fn from_path(path: &str) -> Self {
        Self {
            name: display_name(path),
            path: path.to_string(),
        }
    }
}

/// Output of a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(default)]
    pub clips: Vec<ClipRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// True when the result was scraped from plain text output.
    #[serde(default)]
    pub recovered: bool,
    /// Remaining fields of the worker's payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─── Job ────────────────────────────────────────────────────────────────────

/// A durably tracked unit of work wrapping one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub input_path: String,
    pub input_name: String,
    pub config: Value,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    pub total: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStatistics {
    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
        self.total += count;
    }
}

/// File name component of a path, or the path itself when it has none.
pub fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}
