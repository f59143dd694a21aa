//! Job store with persistent database storage.

use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::StoreError;
use crate::db::job_repo::{self, JobRow, RowFilter, Transition, TransitionOutcome};
use crate::db::log_repo::{self, LogRow};
use crate::db::{stats_repo, Database};
use crate::job::{
    display_name, Job, JobFailure, JobLogLine, JobProgress, JobResult, JobStatistics, JobStatus,
    LogLevel,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

/// Fixed-width microsecond RFC 3339, so text order equals time order.
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(raw: &str, what: &str, job_id: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Unreadable {} for job {}: {}", what, job_id, e);
            None
        }
    }
}

fn parse_status(s: &str, job_id: &str) -> Result<JobStatus, StoreError> {
    s.parse().map_err(|_| StoreError::CorruptStatus {
        job_id: job_id.to_string(),
        status: s.to_string(),
    })
}

fn job_from_row(row: JobRow) -> Result<Job, StoreError> {
    let status = parse_status(&row.status, &row.id)?;
    let config = parse_json::<Value>(&row.config, "config", &row.id).unwrap_or(Value::Null);
    let progress = parse_json::<Map<String, Value>>(&row.progress, "progress", &row.id)
        .map(JobProgress::from_map)
        .unwrap_or_default();
    let result = row
        .result
        .as_deref()
        .and_then(|raw| parse_json::<JobResult>(raw, "result", &row.id));
    let error = row
        .error
        .as_deref()
        .and_then(|raw| parse_json::<JobFailure>(raw, "error", &row.id));

    Ok(Job {
        id: row.id,
        job_type: row.job_type,
        status,
        input_path: row.video_path,
        input_name: row.video_name,
        config,
        progress,
        result,
        error,
        log_file: row.log_file,
        created_at: parse_timestamp(&row.created_at),
        started_at: row.started_at.as_deref().map(parse_timestamp),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
        updated_at: parse_timestamp(&row.updated_at),
    })
}

fn log_line_from_row(row: LogRow) -> JobLogLine {
    let level = row.level.parse().unwrap_or_else(|_| {
        log::warn!("Unknown log level '{}' on line {}", row.level, row.id);
        LogLevel::Info
    });
    JobLogLine {
        seq: row.id,
        timestamp: parse_timestamp(&row.timestamp),
        job_id: row.job_id,
        level,
        message: row.message,
    }
}

// ─── Query types ────────────────────────────────────────────────────────────

/// A single value or a set of values; a set matches any of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSet<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> ValueSet<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            ValueSet::One(value) => std::slice::from_ref(value),
            ValueSet::Many(values) => values,
        }
    }

    /// An empty set; as a filter it matches no job.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Filter for job listing.
///
/// Deserializes from JSON such as
/// `{"status": ["running", "queued"], "type": "analysis", "limit": 20}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ValueSet<JobStatus>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<ValueSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    /// Page size, 100 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(ValueSet::One(status));
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.status = Some(ValueSet::Many(statuses.into_iter().collect()));
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(ValueSet::One(job_type.into()));
        self
    }

    pub fn with_page(mut self, limit: u64, offset: u64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    /// True when a status or type set was given but is empty.
    fn matches_nothing(&self) -> bool {
        self.status.as_ref().is_some_and(ValueSet::is_empty)
            || self.job_type.as_ref().is_some_and(ValueSet::is_empty)
    }

    fn to_row_filter(&self) -> RowFilter {
        RowFilter {
            statuses: self
                .status
                .as_ref()
                .map(|set| set.as_slice().iter().map(|s| s.as_str().to_string()).collect())
                .unwrap_or_default(),
            types: self
                .job_type
                .as_ref()
                .map(|set| set.as_slice().to_vec())
                .unwrap_or_default(),
            video_path: self.input_path.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Number of jobs matching the filter, ignoring pagination.
    pub total: u64,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Persistent job store backed by rusqlite.
///
/// Every operation fails with [`StoreError::Unavailable`] until a database
/// is attached. Status changes are conditional updates, so concurrent
/// writers cannot move a job along an edge the state machine lacks.
pub struct JobStore {
    db: RwLock<Option<Database>>,
    /// Last timestamp handed out; keeps timestamps strictly increasing.
    clock: Mutex<Option<DateTime<Utc>>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    /// Creates a store with no database attached.
    pub fn new() -> Self {
        Self {
            db: RwLock::new(None),
            clock: Mutex::new(None),
        }
    }

    /// Creates a store backed by `db`.
    pub fn with_database(db: Database) -> Self {
        let store = Self::new();
        store.set_database(db);
        store
    }

    /// Sets the database connection.
    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    pub fn is_available(&self) -> bool {
        self.database().is_ok()
    }

    fn database(&self) -> Result<Database, StoreError> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone().ok_or(StoreError::Unavailable)
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut last = match self.clock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now().trunc_subsecs(6);
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    // ── Jobs ────────────────────────────────────────────────────────────────

    /// Persists a new `queued` job.
    pub fn create_job(
        &self,
        job_type: &str,
        input_path: &str,
        config: &Value,
    ) -> Result<Job, StoreError> {
        let db = self.database()?;
        let now = format_timestamp(self.tick());

        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            status: JobStatus::Queued.as_str().to_string(),
            video_path: input_path.to_string(),
            video_name: display_name(input_path),
            config: serde_json::to_string(config)?,
            progress: serde_json::to_string(&JobProgress::default())?,
            result: None,
            error: None,
            log_file: None,
            created_at: now.clone(),
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        job_repo::insert(&db, &row)?;

        log::info!("Created {} job {} for {}", row.job_type, row.id, row.video_path);
        job_from_row(row)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let db = self.database()?;
        job_repo::find_by_id(&db, id)?.map(job_from_row).transpose()
    }

    /// Lists jobs newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, StoreError> {
        let db = self.database()?;
        if filter.matches_nothing() {
            return Ok(JobPage {
                jobs: Vec::new(),
                total: 0,
            });
        }
        let (rows, total) = job_repo::query(&db, &filter.to_row_filter())?;
        let jobs = rows
            .into_iter()
            .filter_map(|row| match job_from_row(row) {
                Ok(job) => Some(job),
                Err(e) => {
                    log::warn!("Skipping job in listing: {}", e);
                    None
                }
            })
            .collect();
        Ok(JobPage { jobs, total })
    }

    /// All jobs currently persisted as `running`.
    pub fn find_running(&self) -> Result<Vec<Job>, StoreError> {
        let filter = JobFilter {
            limit: Some(i64::MAX as u64),
            ..JobFilter::default().with_status(JobStatus::Running)
        };
        Ok(self.list_jobs(&filter)?.jobs)
    }

    fn transition(
        &self,
        id: &str,
        to: JobStatus,
        log_file: Option<&str>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let db = self.database()?;
        let at = format_timestamp(self.tick());
        let from: Vec<&str> = to.predecessors().iter().map(|s| s.as_str()).collect();

        let outcome = job_repo::transition(
            &db,
            &Transition {
                id,
                to: to.as_str(),
                from: &from,
                at: &at,
                stamp_started: to == JobStatus::Running,
                stamp_completed: to.is_terminal(),
                log_file,
                result: result.as_deref(),
                error: error.as_deref(),
            },
        )?;

        match outcome {
            TransitionOutcome::Applied(row) => {
                log::debug!("Job {} is now {}", id, to);
                job_from_row(row)
            }
            TransitionOutcome::Missing => Err(StoreError::NotFound(id.to_string())),
            TransitionOutcome::Rejected(row) => Err(StoreError::InvalidTransition {
                job_id: id.to_string(),
                from: parse_status(&row.status, &row.id)?,
                to,
            }),
        }
    }

    /// `queued → running`; records the start time and transcript path.
    pub fn mark_running(&self, id: &str, log_file: Option<&str>) -> Result<Job, StoreError> {
        self.transition(id, JobStatus::Running, log_file, None, None)
    }

    /// Moves a job to `running` or `cancelled`.
    ///
    /// Terminal success and failure carry a payload and go through
    /// [`set_result`](Self::set_result) and [`set_error`](Self::set_error).
    pub fn update_status(&self, id: &str, status: JobStatus) -> Result<Job, StoreError> {
        match status {
            JobStatus::Completed | JobStatus::Failed => Err(StoreError::PayloadRequired(status)),
            JobStatus::Cancelled => self.set_cancelled(id, &JobFailure::cancelled()),
            _ => self.transition(id, status, None, None, None),
        }
    }

    /// `running → completed` with the worker's result.
    pub fn set_result(&self, id: &str, result: &JobResult) -> Result<Job, StoreError> {
        let payload = serde_json::to_string(result)?;
        self.transition(id, JobStatus::Completed, None, Some(payload), None)
    }

    /// `running → failed` with the failure reason.
    pub fn set_error(&self, id: &str, failure: &JobFailure) -> Result<Job, StoreError> {
        let payload = serde_json::to_string(failure)?;
        self.transition(id, JobStatus::Failed, None, None, Some(payload))
    }

    /// `queued|running → cancelled`, recording `failure` as the error payload.
    pub fn set_cancelled(&self, id: &str, failure: &JobFailure) -> Result<Job, StoreError> {
        let payload = serde_json::to_string(failure)?;
        self.transition(id, JobStatus::Cancelled, None, None, Some(payload))
    }

    /// Deletes a job and its log lines.
    pub fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let db = self.database()?;
        if job_repo::delete(&db, id)? {
            log::info!("Deleted job {}", id);
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    // ── Progress ────────────────────────────────────────────────────────────

    /// Applies `f` to the stored progress record atomically.
    pub fn update_progress<F>(&self, id: &str, f: F) -> Result<JobProgress, StoreError>
    where
        F: FnOnce(&mut JobProgress),
    {
        let db = self.database()?;
        let at = format_timestamp(self.tick());
        let mut updated = None;

        job_repo::modify_progress(&db, id, &at, |raw| {
            let mut progress = parse_json::<Map<String, Value>>(raw, "progress", id)
                .map(JobProgress::from_map)
                .unwrap_or_default();
            f(&mut progress);
            let encoded = Value::Object(progress.as_map().clone()).to_string();
            updated = Some(progress);
            encoded
        })?;

        updated.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Shallow merge: each top-level key in `patch` replaces the stored one.
    pub fn merge_progress(
        &self,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<JobProgress, StoreError> {
        self.update_progress(id, |progress| progress.merge(patch))
    }

    pub fn append_step(&self, id: &str, step: &str) -> Result<JobProgress, StoreError> {
        self.update_progress(id, |progress| progress.push_step(step))
    }

    // ── Logs ────────────────────────────────────────────────────────────────

    pub fn append_log(
        &self,
        id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<JobLogLine, StoreError> {
        let db = self.database()?;
        let timestamp = self.tick();

        let seq = log_repo::insert(
            &db,
            id,
            &format_timestamp(timestamp),
            level.as_str(),
            message,
        )
        .map_err(|e| {
            if e.is_constraint_violation() {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(JobLogLine {
            seq,
            job_id: id.to_string(),
            timestamp,
            level,
            message: message.to_string(),
        })
    }

    /// A job's log lines in append order; empty for unknown jobs.
    pub fn get_logs(
        &self,
        id: &str,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<JobLogLine>, StoreError> {
        let db = self.database()?;
        let rows = log_repo::list_for_job(&db, id, limit, offset)?;
        Ok(rows.into_iter().map(log_line_from_row).collect())
    }

    // ── Statistics ──────────────────────────────────────────────────────────

    pub fn statistics(&self) -> Result<JobStatistics, StoreError> {
        let db = self.database()?;
        let mut stats = JobStatistics::default();
        for (status, count) in stats_repo::status_counts(&db)? {
            match status.parse::<JobStatus>() {
                Ok(status) => stats.add(status, count),
                Err(_) => log::warn!("Ignoring {} jobs with unknown status '{}'", count, status),
            }
        }
        Ok(stats)
    }
}
