//! Extraction of the terminal result from a successful worker run.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use super::parser::ParsedOutput;
use crate::job::{ClipRef, ErrorKind, JobFailure, JobResult};

static VIDEO_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([^\s"',\[\]()]+\.(?:mp4|mov|mkv|avi|webm|m4v))(?:$|[\s"',\[\]()])"#).unwrap()
});
static OUTPUT_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)Output directory:\s*(.+?)\s*$").unwrap());

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResultError {
    /// The worker printed `"success": false`.
    #[error("Worker reported failure: {0}")]
    WorkerReported(String),

    /// Neither the payload nor the text scan produced anything usable.
    #[error("Could not parse worker result: {0}")]
    Unparseable(String),
}

impl ResultError {
    pub fn into_failure(self) -> JobFailure {
        match self {
            ResultError::WorkerReported(message) => {
                JobFailure::new(ErrorKind::ProcessExitError, message)
            }
            ResultError::Unparseable(message) => JobFailure::new(
                ErrorKind::ParseError,
                format!("Could not parse worker result: {}", message),
            ),
        }
    }
}

/// Builds the job result from what the worker printed.
///
/// The last JSON block is preferred, then the whole of stdout. If neither
/// parses, stdout is scanned for clip paths and an output directory, and
/// the result is flagged `recovered`. Paths equal to `input_path` are not
/// treated as clips.
pub fn extract_result(
    parsed: &ParsedOutput,
    input_path: Option<&str>,
) -> Result<JobResult, ResultError> {
    let source = if parsed.json.trim().is_empty() {
        parsed.stdout.trim()
    } else {
        parsed.json.trim()
    };

    let parse_error = match serde_json::from_str::<Value>(source) {
        Ok(Value::Object(map)) => return from_payload(map),
        Ok(_) => "result is not a JSON object".to_string(),
        Err(e) => e.to_string(),
    };

    tracing::warn!(error = %parse_error, "Worker result is not JSON, scanning output");
    recover_from_text(&parsed.stdout, input_path).ok_or(ResultError::Unparseable(parse_error))
}

fn from_payload(mut map: Map<String, Value>) -> Result<JobResult, ResultError> {
    if map.get("success") == Some(&Value::Bool(false)) {
        let message = map
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Worker reported failure")
            .to_string();
        return Err(ResultError::WorkerReported(message));
    }

    let clips = match map.remove("clips") {
        Some(Value::Array(items)) => items.iter().filter_map(clip_from_value).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            tracing::warn!(clips = %other, "Ignoring malformed clips field");
            Vec::new()
        }
    };

    let snake = map.remove("output_dir");
    let camel = map.remove("outputDir");
    let output_dir = camel
        .into_iter()
        .chain(snake)
        .find_map(|v| v.as_str().map(|s| s.to_string()));
    map.remove("recovered");

    Ok(JobResult {
        clips,
        output_dir,
        recovered: false,
        extra: map,
    })
}

fn clip_from_value(value: &Value) -> Option<ClipRef> {
    match value {
        Value::String(path) => Some(ClipRef::from_path(path)),
        Value::Object(obj) => {
            let path = obj.get("path").and_then(Value::as_str)?;
            let mut clip = ClipRef::from_path(path);
            if let Some(name) = obj.get("name").and_then(Value::as_str) {
                clip.name = name.to_string();
            }
            Some(clip)
        }
        other => {
            tracing::warn!(clip = %other, "Ignoring malformed clip entry");
            None
        }
    }
}

fn recover_from_text(stdout: &str, input_path: Option<&str>) -> Option<JobResult> {
    let mut clips: Vec<ClipRef> = Vec::new();
    for caps in VIDEO_PATH_RE.captures_iter(stdout) {
        let path = &caps[1];
        if Some(path) == input_path || clips.iter().any(|c| c.path == path) {
            continue;
        }
        clips.push(ClipRef::from_path(path));
    }

    let output_dir = OUTPUT_DIR_RE
        .captures_iter(stdout)
        .last()
        .map(|caps| caps[1].to_string());

    if clips.is_empty() && output_dir.is_none() {
        return None;
    }

    Some(JobResult {
        clips,
        output_dir,
        recovered: true,
        extra: Map::new(),
    })
}
