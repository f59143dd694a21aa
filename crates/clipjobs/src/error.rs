use std::path::PathBuf;
use thiserror::Error;

use crate::job::ErrorKind;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ClipjobsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl ClipjobsError {
    /// Reason code callers can match on.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClipjobsError::Store(e) => e.kind(),
            ClipjobsError::Supervisor(SupervisorError::Spawn { .. }) => Some(ErrorKind::SpawnError),
            ClipjobsError::Worker(_) => Some(ErrorKind::SpawnError),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn worker '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {0} already has a live worker")]
    AlreadyRunning(String),

    #[error("Worker output stream was not captured")]
    MissingStream,

    #[error("Process registry lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid job configuration: {0}")]
    InvalidOptions(String),

    #[error("Failed to write transcript '{path}': {source}")]
    Transcript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ClipjobsError>;
