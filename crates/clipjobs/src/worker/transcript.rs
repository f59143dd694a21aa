//! On-disk transcript of one worker run.
//!
//! Write failures are logged once and disable the transcript; they never
//! affect the job.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::parser::StreamKind;
use crate::error::WorkerError;

pub struct Transcript {
    path: PathBuf,
    file: Option<File>,
}

impl Transcript {
    /// `<log_dir>/<job id>.log`
    pub fn path_for(log_dir: &Path, job_id: &str) -> PathBuf {
        log_dir.join(format!("{}.log", job_id))
    }

    /// Creates the file (and its directory) and writes the header.
    pub async fn create(
        path: PathBuf,
        command_line: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self, WorkerError> {
        let io_err = |source| WorkerError::Transcript {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = File::create(&path).await.map_err(io_err)?;
        let header = format!(
            "=== clipjobs worker transcript ===\nstarted: {}\ncommand: {}\n\n",
            started_at.to_rfc3339(),
            command_line
        );
        file.write_all(header.as_bytes()).await.map_err(io_err)?;

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// A transcript that records nothing, used when the file cannot be created.
    pub fn disabled(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&mut self, stream: StreamKind, line: &str) {
        let entry = format!("[{}] {}\n", stream.as_str(), line);
        self.write(entry.as_bytes()).await;
    }

    /// Writes the footer and flushes.
    pub async fn finish(&mut self, outcome: &str, finished_at: DateTime<Utc>) {
        let footer = format!(
            "\n=== finished: {} ({}) ===\n",
            finished_at.to_rfc3339(),
            outcome
        );
        self.write(footer.as_bytes()).await;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush transcript");
            }
        }
        self.file = None;
    }

    async fn write(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(bytes).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Transcript write failed, disabling transcript"
            );
            self.file = None;
        }
    }
}
