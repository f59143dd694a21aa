use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::{ErrorKind, JobStatus};

/// Errors returned by [`JobStore`](super::JobStore) operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job store is unavailable: no database has been attached")]
    Unavailable,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Status '{0}' carries a payload; use set_result or set_error")]
    PayloadRequired(JobStatus),

    #[error("Job {job_id} has unreadable status '{status}'")]
    CorruptStatus { job_id: String, status: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Failed to serialize job payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::Unavailable => Some(ErrorKind::StoreUnavailable),
            StoreError::NotFound(_) => Some(ErrorKind::NotFound),
            StoreError::InvalidTransition { .. } | StoreError::PayloadRequired(_) => {
                Some(ErrorKind::InvalidTransition)
            }
            _ => None,
        }
    }
}
