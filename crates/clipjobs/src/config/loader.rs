use std::path::Path;

use crate::config::schema::OrchestratorConfig;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: OrchestratorConfig = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker.executable.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "worker.executable must not be empty".to_string(),
        });
    }

    if config.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "event_capacity must be at least 1".to_string(),
        });
    }

    if let Some(dir) = &config.worker.working_directory {
        if !dir.is_dir() {
            return Err(ConfigError::Validation {
                message: format!(
                    "worker.working_directory '{}' is not a directory",
                    dir.display()
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogFormat;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{"version": "1.0"}"#).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.worker.executable, "python3");
        assert_eq!(config.worker.terminate_grace_secs, 5);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "worker": {
                "executable": "/usr/bin/python3",
                "args": ["-u", "clipper_unified_v2.py"],
                "terminate_grace_secs": 10,
                "env": {"PYTHONUNBUFFERED": "1"}
            },
            "database_path": "/tmp/clipjobs/jobs.db",
            "log_directory": "/tmp/clipjobs/logs",
            "event_capacity": 64,
            "logging": {"level": "clipjobs=debug", "format": "json"}
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.worker.args, vec!["-u", "clipper_unified_v2.py"]);
        assert_eq!(config.worker.terminate_grace_secs, 10);
        assert_eq!(config.worker.env["PYTHONUNBUFFERED"], "1");
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.resolved_database_path().unwrap(),
            std::path::PathBuf::from("/tmp/clipjobs/jobs.db")
        );
    }

    #[test]
    fn test_default_paths_under_home() {
        let config = OrchestratorConfig::default();
        if dirs::home_dir().is_some() {
            assert!(config.resolved_database_path().unwrap().ends_with("clipjobs.db"));
            assert!(config
                .resolved_log_directory()
                .unwrap()
                .ends_with(".clipjobs/logs"));
        }
    }

    #[test]
    fn test_schema_rejects_unknown_fields() {
        let err = load_config_from_str(r#"{"version": "1.0", "workers": 4}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_schema_rejects_wrong_version() {
        let err = load_config_from_str(r#"{"version": "2.0"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_schema_rejects_zero_capacity() {
        let err =
            load_config_from_str(r#"{"version": "1.0", "event_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_blank_executable_rejected() {
        let err = load_config_from_str(r#"{"version": "1.0", "worker": {"executable": "  "}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_missing_working_directory_rejected() {
        let err = load_config_from_str(
            r#"{"version": "1.0", "worker": {"executable": "sh", "working_directory": "/definitely/not/here"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let err = load_config_from_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseJson(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipjobs.json");
        std::fs::write(&path, r#"{"version": "1.0", "event_capacity": 8}"#).unwrap();
        assert_eq!(load_config(&path).unwrap().event_capacity, 8);

        let err = load_config(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
