//! Job event broadcaster for real-time status, progress and log streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobFailure, JobLogLine, JobProgress, JobResult, JobStatus};

/// Event delivered to observers.
///
/// Serializes as `{"event": "job-progress", "jobId": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    JobStatusChange {
        job_id: String,
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobProgress {
        job_id: String,
        progress: JobProgress,
    },
    #[serde(rename_all = "camelCase")]
    JobLog { job_id: String, line: JobLogLine },
    #[serde(rename_all = "camelCase")]
    JobComplete { job_id: String, result: JobResult },
    #[serde(rename_all = "camelCase")]
    JobError { job_id: String, error: JobFailure },
}

impl JobEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::JobStatusChange { .. } => "job-status-change",
            JobEvent::JobProgress { .. } => "job-progress",
            JobEvent::JobLog { .. } => "job-log",
            JobEvent::JobComplete { .. } => "job-complete",
            JobEvent::JobError { .. } => "job-error",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::JobStatusChange { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobLog { job_id, .. }
            | JobEvent::JobComplete { job_id, .. }
            | JobEvent::JobError { job_id, .. } => job_id,
        }
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    /// Creates a broadcaster whose subscribers buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn publish_status(&self, job_id: &str, status: JobStatus, timestamp: DateTime<Utc>) {
        self.send(JobEvent::JobStatusChange {
            job_id: job_id.to_string(),
            status,
            timestamp,
        });
    }

    pub fn publish_progress(&self, job_id: &str, progress: &JobProgress) {
        self.send(JobEvent::JobProgress {
            job_id: job_id.to_string(),
            progress: progress.clone(),
        });
    }

    pub fn publish_log(&self, line: &JobLogLine) {
        self.send(JobEvent::JobLog {
            job_id: line.job_id.clone(),
            line: line.clone(),
        });
    }

    pub fn publish_complete(&self, job_id: &str, result: &JobResult) {
        self.send(JobEvent::JobComplete {
            job_id: job_id.to_string(),
            result: result.clone(),
        });
    }

    pub fn publish_error(&self, job_id: &str, error: &JobFailure) {
        self.send(JobEvent::JobError {
            job_id: job_id.to_string(),
            error: error.clone(),
        });
    }

    /// Creates a new subscriber receiving every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Creates a subscriber that only yields events for `job_id`.
    pub fn subscribe_job(&self, job_id: &str) -> JobEventStream {
        JobEventStream {
            job_id: job_id.to_string(),
            receiver: self.subscribe(),
        }
    }

    /// Returns the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A subscription narrowed to one job.
pub struct JobEventStream {
    job_id: String,
    receiver: broadcast::Receiver<JobEvent>,
}

impl JobEventStream {
    /// Next event for this job, or `None` once the broadcaster is gone.
    ///
    /// Events lost to lag are skipped.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.job_id() == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorKind, LogLevel};
    use serde_json::json;

    #[test]
    fn test_send_without_receivers() {
        let broadcaster = JobEventBroadcaster::new(4);
        broadcaster.publish_status("j1", JobStatus::Running, Utc::now());
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let timestamp = Utc::now();
        let event = JobEvent::JobStatusChange {
            job_id: "j1".to_string(),
            status: JobStatus::Running,
            timestamp,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!("job-status-change"));
        assert_eq!(value["jobId"], json!("j1"));
        assert_eq!(value["status"], json!("running"));
        assert_eq!(event.name(), "job-status-change");

        let error = JobEvent::JobError {
            job_id: "j1".to_string(),
            error: JobFailure::new(ErrorKind::SpawnError, "missing"),
        };
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["event"], json!("job-error"));
        assert_eq!(value["error"]["code"], json!("SPAWN_ERROR"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let broadcaster = JobEventBroadcaster::default();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish_progress("j1", &JobProgress::default());
        broadcaster.publish_log(&JobLogLine {
            seq: 1,
            job_id: "j1".to_string(),
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "hello".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().name(), "job-progress");
        let log = rx.recv().await.unwrap();
        assert_eq!(log.name(), "job-log");
        assert_eq!(log.job_id(), "j1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let broadcaster = JobEventBroadcaster::new(2);
        let mut stream = broadcaster.subscribe_job("j1");

        for _ in 0..5 {
            broadcaster.publish_progress("j1", &JobProgress::default());
        }
        broadcaster.publish_complete("j1", &JobResult::default());
        drop(broadcaster);

        let mut names = Vec::new();
        while let Some(event) = stream.next().await {
            names.push(event.name());
        }
        assert_eq!(names.len(), 2);
        assert_eq!(names.last(), Some(&"job-complete"));
    }

    #[tokio::test]
    async fn test_stream_filters_other_jobs() {
        let broadcaster = JobEventBroadcaster::default();
        let mut stream = broadcaster.subscribe_job("mine");

        broadcaster.publish_status("other", JobStatus::Running, Utc::now());
        broadcaster.publish_status("mine", JobStatus::Running, Utc::now());

        let event = stream.next().await.unwrap();
        assert_eq!(event.job_id(), "mine");
        assert_eq!(stream.job_id(), "mine");
    }
}
