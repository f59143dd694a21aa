use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub worker: WorkerSettings,
    /// SQLite file; `~/.clipjobs/data/clipjobs.db` when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Transcript directory; `~/.clipjobs/logs` when unset.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            worker: WorkerSettings::default(),
            database_path: None,
            log_directory: None,
            event_capacity: default_event_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Database path with the home-directory default applied.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }

    /// Transcript directory with the home-directory default applied.
    pub fn resolved_log_directory(&self) -> Option<PathBuf> {
        self.log_directory
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".clipjobs").join("logs")))
    }
}

/// How to launch the worker program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub executable: String,
    /// Arguments placed before the input path, e.g. a script name.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Seconds between SIGTERM and a forced kill.
    #[serde(default = "default_grace_secs")]
    pub terminate_grace_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_grace_secs() -> u64 {
    5
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
            args: vec!["clipper_unified_v2.py".to_string()],
            working_directory: None,
            terminate_grace_secs: default_grace_secs(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
