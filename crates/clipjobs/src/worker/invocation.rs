//! Worker command line derived from settings and a job's stored config.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::config::WorkerSettings;
use crate::error::WorkerError;
use crate::job::Job;

/// Options read from a job's `config` blob. Unknown keys are ignored.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, alias = "output_dir")]
    pub output_dir: Option<String>,
    #[serde(default, alias = "min_duration")]
    pub min_duration: Option<f64>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, alias = "no_cache")]
    pub no_cache: bool,
    #[serde(default, alias = "config_path")]
    pub config_path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerOptions {
    pub fn from_config(config: &Value) -> Result<Self, WorkerError> {
        let options: WorkerOptions = match config {
            Value::Null => return Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(config.clone())
                .map_err(|e| WorkerError::InvalidOptions(e.to_string()))?,
            _ => {
                return Err(WorkerError::InvalidOptions(
                    "job config must be a JSON object".to_string(),
                ))
            }
        };

        if let Some(min) = options.min_duration {
            if !min.is_finite() || min < 0.0 {
                return Err(WorkerError::InvalidOptions(format!(
                    "minDuration must be a non-negative number, got {}",
                    min
                )));
            }
        }

        Ok(options)
    }
}

/// A fully resolved worker command.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl WorkerInvocation {
    /// `<exe> <base args> <input> --mode <mode> --json [-o dir]
    /// [--min-duration n] [-d] [--no-cache] [-c path]`
    pub fn build(settings: &WorkerSettings, job: &Job) -> Result<Self, WorkerError> {
        let options = WorkerOptions::from_config(&job.config)?;

        let mut args = settings.args.clone();
        args.push(job.input_path.clone());
        args.push("--mode".to_string());
        args.push(options.mode.clone().unwrap_or_else(|| job.job_type.clone()));
        args.push("--json".to_string());

        if let Some(dir) = &options.output_dir {
            args.push("-o".to_string());
            args.push(dir.clone());
        }
        if let Some(min) = options.min_duration {
            args.push("--min-duration".to_string());
            args.push(min.to_string());
        }
        if options.debug {
            args.push("-d".to_string());
        }
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        if let Some(path) = &options.config_path {
            args.push("-c".to_string());
            args.push(path.clone());
        }

        let mut env = settings.env.clone();
        env.extend(options.env);

        Ok(Self {
            program: settings.executable.clone(),
            args,
            working_dir: settings.working_directory.clone(),
            env,
        })
    }

    /// Human-readable command line for transcripts.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                if part.is_empty() || part.chars().any(|c| c.is_whitespace() || c == '\'') {
                    format!("'{}'", part.replace('\'', "'\\''"))
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
