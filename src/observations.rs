//! Observation records and the append-only observation log
//!
//! Observations are produced by hook capture outside this crate and arrive as
//! JSON lines. They are immutable here: the rule engine only reads them, and
//! processing state is tracked in the store rather than written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::truncate_chars;

/// Raw payloads are capped at capture time; anything longer is cut on load
pub const MAX_RAW_PAYLOAD_CHARS: usize = 1000;

/// One recorded tool-use event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default, alias = "raw_payload")]
    pub raw_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, deserialize_with = "optional_flag", skip_serializing_if = "Option::is_none")]
    pub tool_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_error: Option<String>,
    #[serde(default, deserialize_with = "required_flag")]
    pub processed: bool,
}

/// Capture writes flags as 0/1; accept either form
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> bool {
        match flag {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

fn optional_flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<bool>, D::Error> {
    Ok(Option::<Flag>::deserialize(d)?.map(bool::from))
}

fn required_flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(Option::<Flag>::deserialize(d)?.map(bool::from).unwrap_or(false))
}

impl Observation {
    /// Build a tool observation (mostly used by tests and fixtures)
    pub fn tool_event(
        id: &str,
        session_id: &str,
        timestamp: &str,
        tool_name: &str,
        error: Option<&str>,
    ) -> Self {
        let raw = match error {
            Some(err) => serde_json::json!({ "tool_name": tool_name, "error": err }),
            None => serde_json::json!({ "tool_name": tool_name }),
        };
        Self {
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            session_id: session_id.to_string(),
            event_type: "post_tool".to_string(),
            raw_json: raw.to_string(),
            project_path: None,
            tool_name: Some(tool_name.to_string()),
            tool_success: Some(error.is_none()),
            tool_error: error.map(|e| e.to_string()),
            processed: false,
        }
    }

    /// Date part of the timestamp (`YYYY-MM-DD`)
    pub fn date(&self) -> &str {
        match self.timestamp.char_indices().nth(10) {
            Some((idx, _)) => &self.timestamp[..idx],
            None => &self.timestamp,
        }
    }
}

/// Precomputed lookup structure for evaluating conditions against one observation
#[derive(Debug, Clone)]
pub struct ObservationView<'a> {
    pub observation: &'a Observation,
    fields: Value,
    payload: Option<Value>,
}

impl<'a> ObservationView<'a> {
    pub fn new(observation: &'a Observation) -> Self {
        let fields = serde_json::to_value(observation).unwrap_or(Value::Null);
        let payload = serde_json::from_str::<Value>(&observation.raw_json)
            .ok()
            .filter(|v| v.is_object());
        Self { observation, fields, payload }
    }

    /// Resolve a dot-notation path; observation fields shadow payload fields.
    /// Unresolvable paths and JSON nulls both yield `None`.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        let path = path.strip_prefix("observation.").unwrap_or(path);
        if path.is_empty() {
            return None;
        }
        if let Some(v) = lookup(&self.fields, path) {
            return Some(v);
        }
        if path == "payload" {
            return self.payload.as_ref();
        }
        let inner = path.strip_prefix("payload.").unwrap_or(path);
        self.payload.as_ref().and_then(|p| lookup(p, inner))
    }

    /// Text scanned for domain keywords
    pub fn domain_text(&self) -> String {
        format!(
            "{} {} {}",
            self.observation.raw_json,
            self.observation.tool_error.as_deref().unwrap_or(""),
            self.observation.tool_name.as_deref().unwrap_or("")
        )
    }

    /// Whole-record text used by scope inference
    pub fn record_text(&self) -> String {
        self.fields.to_string()
    }
}

fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Presence/truthiness of a resolved value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// String form of a resolved value as used by `contains` / `matches` / `==`
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Append-only JSON-lines observation log
pub struct ObservationLog {
    path: PathBuf,
}

impl ObservationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed observation; malformed lines are skipped
    pub fn read_all(&self) -> Result<Vec<Observation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let mut observations = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", self.path.display()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Observation>(line) {
                Ok(mut obs) => {
                    if obs.raw_json.chars().count() > MAX_RAW_PAYLOAD_CHARS {
                        obs.raw_json = truncate_chars(&obs.raw_json, MAX_RAW_PAYLOAD_CHARS);
                    }
                    observations.push(obs);
                }
                Err(e) => debug!("Skipping malformed observation on line {}: {}", line_no + 1, e),
            }
        }

        Ok(observations)
    }

    /// Unprocessed observations in log order, at most `limit`
    pub fn read_unprocessed(&self, limit: usize) -> Result<Vec<Observation>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|o| !o.processed)
            .take(limit)
            .collect())
    }

    /// Append one observation
    pub fn append(&self, observation: &Observation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(observation)?)?;
        Ok(())
    }
}
