//! Job orchestrator: the public face of the crate.
//!
//! Composes the store, the process supervisor and the event broadcaster and
//! drives each job through `queued → running → completed | failed |
//! cancelled`.

mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broadcast::{JobEvent, JobEventBroadcaster, JobEventStream};
use crate::config::{OrchestratorConfig, WorkerSettings};
use crate::db::Database;
use crate::error::{ClipjobsError, ConfigError, Result};
use crate::job::{ErrorKind, Job, JobFailure, JobLogLine, JobStatistics, JobStatus};
use crate::store::{JobFilter, JobPage, JobStore, StoreError};
use crate::worker::{ProcessSupervisor, Transcript, WorkerInvocation};

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub input_path: String,
    #[serde(default)]
    pub config: Value,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, input_path: impl Into<String>, config: Value) -> Self {
        Self {
            job_type: job_type.into(),
            input_path: input_path.into(),
            config,
        }
    }
}

/// Cheap to clone; clones share the same store, workers and subscribers.
#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<JobStore>,
    supervisor: Arc<ProcessSupervisor>,
    events: JobEventBroadcaster,
    worker: Arc<WorkerSettings>,
    log_dir: PathBuf,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<JobStore>,
        worker: WorkerSettings,
        log_dir: PathBuf,
        events: JobEventBroadcaster,
    ) -> Self {
        let grace = Duration::from_secs(worker.terminate_grace_secs);
        Self {
            store,
            supervisor: Arc::new(ProcessSupervisor::new(grace)),
            events,
            worker: Arc::new(worker),
            log_dir,
        }
    }

    /// Opens the configured database and wires everything together.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let db_path = config
            .resolved_database_path()
            .ok_or_else(|| no_home("database_path"))?;
        let log_dir = config
            .resolved_log_directory()
            .ok_or_else(|| no_home("log_directory"))?;

        let db = Database::open(&db_path).map_err(StoreError::from)?;
        tracing::info!(
            database = %db_path.display(),
            logs = %log_dir.display(),
            "Job orchestrator ready"
        );

        Ok(Self::new(
            Arc::new(JobStore::with_database(db)),
            config.worker.clone(),
            log_dir,
            JobEventBroadcaster::new(config.event_capacity),
        ))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_job(&self, job_id: &str) -> JobEventStream {
        self.events.subscribe_job(job_id)
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Persists a `queued` job.
    pub fn create_job(&self, request: NewJob) -> Result<Job> {
        let job = self
            .store
            .create_job(&request.job_type, &request.input_path, &request.config)?;
        self.events
            .publish_status(&job.id, job.status, job.created_at);
        Ok(job)
    }

    /// Moves a queued job to `running` and spawns its worker.
    ///
    /// Returns once the worker is spawned. If it cannot be spawned the job
    /// is failed with `SPAWN_ERROR` and returned in that state.
    pub async fn start_job(&self, job_id: &str) -> Result<Job> {
        let job = self.require_job(job_id)?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Running,
            }
            .into());
        }

        let log_path = Transcript::path_for(&self.log_dir, job_id);
        let log_file = log_path.to_string_lossy().to_string();
        let job = self.store.mark_running(job_id, Some(log_file.as_str()))?;
        self.events
            .publish_status(job_id, job.status, job.started_at.unwrap_or(job.updated_at));

        let invocation = match WorkerInvocation::build(&self.worker, &job) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Rejecting job configuration");
                let failure = JobFailure::new(ErrorKind::SpawnError, e.to_string());
                return self.fail_unstarted(&job, failure);
            }
        };

        let mut transcript =
            match Transcript::create(log_path.clone(), &invocation.command_line(), Utc::now())
                .await
            {
                Ok(transcript) => transcript,
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Continuing without transcript");
                    Transcript::disabled(log_path)
                }
            };

        let spawned = match self.supervisor.spawn(job_id, &invocation) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to spawn worker");
                transcript.finish(&format!("spawn failed: {}", e), Utc::now()).await;
                let failure = JobFailure::new(ErrorKind::SpawnError, e.to_string());
                return self.fail_unstarted(&job, failure);
            }
        };

        // A cancel that landed between mark_running and spawn found no worker.
        if matches!(self.store.get_job(job_id), Ok(Some(ref j)) if j.status == JobStatus::Cancelled)
        {
            self.supervisor.signal_terminate(job_id);
        }

        tokio::spawn(run::drive(self.clone(), job.clone(), spawned, transcript));
        Ok(job)
    }

    fn fail_unstarted(&self, job: &Job, failure: JobFailure) -> Result<Job> {
        let failure = failure.with_log_file(job.log_file.as_deref());
        match self.store.set_error(&job.id, &failure) {
            Ok(failed) => {
                self.publish_failed(&failed, &failure);
                Ok(failed)
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(self.require_job(&job.id)?),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancels a queued or running job.
    ///
    /// A live worker is signaled first; the call does not wait for it to
    /// exit. Terminal jobs are returned unchanged.
    pub fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let job = self.require_job(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let signaled = self.supervisor.signal_terminate(job_id);
        let failure = JobFailure::cancelled().with_log_file(job.log_file.as_deref());
        match self.store.set_cancelled(job_id, &failure) {
            Ok(cancelled) => {
                tracing::info!(job_id, signaled, "Job cancelled");
                self.events.publish_status(
                    job_id,
                    cancelled.status,
                    cancelled.completed_at.unwrap_or(cancelled.updated_at),
                );
                Ok(cancelled)
            }
            // The run task finalized the job first.
            Err(StoreError::InvalidTransition { .. }) => self.require_job(job_id),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a job and its logs, stopping its worker and removing the
    /// transcript.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id)?;
        self.supervisor.signal_terminate(job_id);
        self.store.delete_job(job_id)?;

        if let Some(log_file) = &job.log_file {
            match tokio::fs::remove_file(log_file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id, log_file = %log_file, error = %e, "Failed to remove transcript")
                }
            }
        }
        Ok(())
    }

    /// Fails jobs persisted as `running` that have no live worker, e.g.
    /// after a restart. Returns the jobs it failed.
    pub fn recover_interrupted_jobs(&self) -> Result<Vec<Job>> {
        let mut recovered = Vec::new();
        for job in self.store.find_running()? {
            if self.supervisor.is_live(&job.id) {
                continue;
            }
            let failure = JobFailure::new(
                ErrorKind::ProcessExitError,
                "Worker was interrupted before it finished",
            )
            .with_code("INTERRUPTED")
            .with_log_file(job.log_file.as_deref());

            match self.store.set_error(&job.id, &failure) {
                Ok(failed) => {
                    tracing::warn!(job_id = %failed.id, "Marked interrupted job as failed");
                    self.publish_failed(&failed, &failure);
                    recovered.push(failed);
                }
                Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovered)
    }

    /// Signals every live worker. Returns how many were signaled.
    pub fn shutdown(&self) -> usize {
        let count = self.supervisor.terminate_all();
        if count > 0 {
            tracing::info!(count, "Terminating live workers");
        }
        count
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        Ok(self.store.list_jobs(filter)?)
    }

    pub fn get_statistics(&self) -> Result<JobStatistics> {
        Ok(self.store.statistics()?)
    }

    pub fn get_logs(
        &self,
        job_id: &str,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<JobLogLine>> {
        Ok(self.store.get_logs(job_id, limit, offset)?)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.supervisor.is_live(job_id)
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn require_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()).into())
    }

    fn publish_failed(&self, job: &Job, failure: &JobFailure) {
        self.events.publish_status(
            &job.id,
            job.status,
            job.completed_at.unwrap_or(job.updated_at),
        );
        self.events.publish_error(&job.id, failure);
    }
}

fn no_home(field: &str) -> ClipjobsError {
    ConfigError::Validation {
        message: format!("{} is not set and no home directory was found", field),
    }
    .into()
}
