//! Line classifier for worker output.
//!
//! [`OutputParser`] is a per-job accumulator: it is fed one line at a time
//! and does no I/O, so it can be driven from tests as easily as from the
//! process readers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::job::LogLevel;

/// Maximum stdout kept for result extraction (10 MiB). Also bounds the
/// JSON block buffer.
pub const MAX_STDOUT_BYTES: usize = 10 * 1024 * 1024;

static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[STEP\]\s*(.*?)\s*$").unwrap());
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[PROGRESS\]\s*(.*?)\s*$").unwrap());
static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Processing frame (\d+)/(\d+)").unwrap());
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Progress:\s*(\d+(?:\.\d+)?)%").unwrap());

/// Which standard stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Classified output line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// `[STEP] <text>`
    Step(String),
    /// `[PROGRESS] <json object>`
    Progress(Map<String, Value>),
    /// `[PROGRESS]` whose payload is not a JSON object.
    InvalidProgress { raw: String, error: String },
    /// `Processing frame X/Y`
    FrameProgress { current: u64, total: u64 },
    /// `Progress: N%`
    Percent(f64),
    /// Anything else that is not blank.
    Log { level: LogLevel, message: String },
}

/// What the parser accumulated by the time the worker exited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Last JSON block seen on stdout.
    pub json: String,
    /// Accumulated stdout, newline-joined.
    pub stdout: String,
    /// Last non-blank stderr line.
    pub last_stderr: Option<String>,
}

/// Stateful classifier for one worker run.
#[derive(Debug, Default)]
pub struct OutputParser {
    in_json: bool,
    json: String,
    json_overflowed: bool,
    stdout: String,
    stdout_truncated: bool,
    last_stderr: Option<String>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies one line. Returns `None` for lines that only feed the
    /// JSON buffer and for blank lines.
    pub fn feed(&mut self, stream: StreamKind, line: &str) -> Option<OutputEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        match stream {
            StreamKind::Stdout => {
                self.record_stdout(line);
                if self.track_json(line) {
                    return None;
                }
            }
            StreamKind::Stderr => {
                if !line.trim().is_empty() {
                    self.last_stderr = Some(line.to_string());
                }
            }
        }

        classify(stream, line)
    }

    /// Returns true when the line belongs to a JSON block.
    ///
    /// A block opens on a line starting with `{` and closes on the first line
    /// containing `}`; nested braces over several lines end it early.
    fn track_json(&mut self, line: &str) -> bool {
        if line.trim_start().starts_with('{') {
            self.in_json = true;
            self.json.clear();
        }
        if !self.in_json {
            return false;
        }

        if self.json.len() + line.len() + 1 > MAX_STDOUT_BYTES {
            // Unterminated or oversized block: drop it, later lines are classified normally.
            self.in_json = false;
            self.json.clear();
            if !self.json_overflowed {
                self.json_overflowed = true;
                tracing::warn!(
                    "Worker JSON block exceeded {} bytes, dropping it",
                    MAX_STDOUT_BYTES
                );
            }
            return true;
        }

        self.json.push_str(line);
        self.json.push('\n');
        if line.contains('}') {
            self.in_json = false;
        }
        true
    }

    fn record_stdout(&mut self, line: &str) {
        if self.stdout_truncated {
            return;
        }
        if self.stdout.len() + line.len() + 1 > MAX_STDOUT_BYTES {
            self.stdout_truncated = true;
            tracing::warn!("Worker stdout exceeded {} bytes, truncating", MAX_STDOUT_BYTES);
            return;
        }
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    pub fn last_stderr(&self) -> Option<&str> {
        self.last_stderr.as_deref()
    }

    pub fn finish(self) -> ParsedOutput {
        ParsedOutput {
            json: self.json,
            stdout: self.stdout,
            last_stderr: self.last_stderr,
        }
    }
}

fn classify(stream: StreamKind, line: &str) -> Option<OutputEvent> {
    if let Some(caps) = STEP_RE.captures(line) {
        return Some(OutputEvent::Step(caps[1].to_string()));
    }

    if let Some(caps) = PROGRESS_RE.captures(line) {
        let raw = &caps[1];
        return Some(match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => OutputEvent::Progress(map),
            Ok(other) => OutputEvent::InvalidProgress {
                raw: raw.to_string(),
                error: format!("expected a JSON object, got {}", json_type(&other)),
            },
            Err(e) => OutputEvent::InvalidProgress {
                raw: raw.to_string(),
                error: e.to_string(),
            },
        });
    }

    if let Some(caps) = FRAME_RE.captures(line) {
        if let (Ok(current), Ok(total)) = (caps[1].parse(), caps[2].parse()) {
            return Some(OutputEvent::FrameProgress { current, total });
        }
    }

    if let Some(caps) = PERCENT_RE.captures(line) {
        if let Ok(percent) = caps[1].parse::<f64>() {
            return Some(OutputEvent::Percent(percent));
        }
    }

    if line.trim().is_empty() {
        return None;
    }

    let level = match stream {
        StreamKind::Stdout => LogLevel::Info,
        StreamKind::Stderr => LogLevel::Error,
    };
    Some(OutputEvent::Log {
        level,
        message: line.to_string(),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
