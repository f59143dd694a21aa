//! Test harness for isolated orchestrator runs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use clipjobs::db::Database;
use clipjobs::{
    Job, JobEvent, JobEventBroadcaster, JobEventStream, JobOrchestrator, JobStatus, JobStore,
    NewJob, WorkerSettings,
};

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// An orchestrator whose worker is `sh -c <script> clipjobs-worker <args...>`.
///
/// Inside the script `$1` is the job's input path.
pub struct TestHarness {
    temp_dir: TempDir,
    pub log_dir: PathBuf,
    pub store: Arc<JobStore>,
    pub orchestrator: JobOrchestrator,
}

impl TestHarness {
    pub fn with_script(script: &str) -> Self {
        Self::with_settings(WorkerSettings {
            executable: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "clipjobs-worker".to_string(),
            ],
            terminate_grace_secs: 1,
            ..Default::default()
        })
    }

    pub fn with_settings(settings: WorkerSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log_dir = temp_dir.path().join("logs");
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let store = Arc::new(JobStore::with_database(db));
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store),
            settings,
            log_dir.clone(),
            JobEventBroadcaster::new(1024),
        );

        Self {
            temp_dir,
            log_dir,
            store,
            orchestrator,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn create(&self, config: Value) -> Job {
        self.orchestrator
            .create_job(NewJob::new("analysis", "/v/input.mp4", config))
            .expect("Failed to create job")
    }

    /// Creates a job, subscribes to it and starts it.
    pub async fn start(&self, config: Value) -> (Job, JobEventStream) {
        let job = self.create(config);
        let events = self.orchestrator.subscribe_job(&job.id);
        let started = self
            .orchestrator
            .start_job(&job.id)
            .await
            .expect("Failed to start job");
        (started, events)
    }

    /// Polls the store until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: &str) -> Job {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let job = self
                .orchestrator
                .get_job(job_id)
                .expect("Failed to read job")
                .expect("Job disappeared");
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Job {} still {} after {:?}",
                job_id,
                job.status,
                WAIT_TIMEOUT
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Polls until no worker is live for the job.
    pub async fn wait_for_exit(&self, job_id: &str) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.orchestrator.is_running(job_id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Worker for {} still live",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Collects a job's events up to and including the one that settles it:
/// `job-complete`, `job-error` or a `cancelled` status change.
pub async fn events_until_settled(stream: &mut JobEventStream) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT_TIMEOUT, stream.next())
            .await
            .expect("Timed out waiting for job events")
            .expect("Event channel closed");
        let settled = matches!(
            event,
            JobEvent::JobComplete { .. }
                | JobEvent::JobError { .. }
                | JobEvent::JobStatusChange {
                    status: JobStatus::Cancelled,
                    ..
                }
        );
        events.push(event);
        if settled {
            return events;
        }
    }
}

/// Statuses announced in `events`, in order.
pub fn statuses(events: &[JobEvent]) -> Vec<JobStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            JobEvent::JobStatusChange { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}
