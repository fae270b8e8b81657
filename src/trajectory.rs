//! Append-only JSONL event log for one agent run.
//!
//! Every line is one [`TrajectoryEvent`]. Lines are written and flushed one at
//! a time, so a killed run still leaves a readable prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::trace;

use crate::error::AgentboxError;
use crate::llm::{Role, ToolCall};

pub const SCHEMA_VERSION: &str = "1.0";

/// File name of a run's trajectory inside the output directory.
pub fn trajectory_file_name(task_id: &str) -> String {
    format!("{}_trajectory.jsonl", task_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Config,
    Message,
    Tool,
    Outcome,
}

/// Fields are declared alphabetically so serialized keys come out sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    pub payload: Value,
    pub schema_version: String,
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: EventType,
}

impl TrajectoryEvent {
    pub fn new(kind: EventType, payload: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            payload,
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp,
            kind,
        }
    }
}

pub struct TrajectoryWriter {
    path: PathBuf,
    file: File,
    events: Vec<TrajectoryEvent>,
}

impl TrajectoryWriter {
    /// Start a fresh log at `path`, replacing any previous run's file.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open trajectory {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            events: Vec::new(),
        })
    }

    pub fn log(&mut self, kind: EventType, payload: Value) -> Result<()> {
        let event = TrajectoryEvent::new(kind, payload);
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        trace!(kind = ?kind, index = self.events.len(), "trajectory:event written");
        self.events.push(event);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events written by this writer, in order.
    pub fn events(&self) -> &[TrajectoryEvent] {
        &self.events
    }
}

/// Read a trajectory file, skipping blank lines.
pub fn load_trajectory(path: &Path) -> Result<Vec<TrajectoryEvent>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open trajectory {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<TrajectoryEvent>(&line).map_err(|e| {
            AgentboxError::MalformedTrajectory {
                path: path.to_path_buf(),
                line: index + 1,
                reason: e.to_string(),
            }
        })?;
        events.push(event);
    }
    Ok(events)
}

pub fn config_payload(model: Value, sandbox: Value, agent: Value, task: Value) -> Value {
    json!({ "model": model, "sandbox": sandbox, "agent": agent, "task": task })
}

pub fn message_payload(role: Role, content: &str, tool_calls: &[ToolCall]) -> Value {
    json!({ "role": role, "content": content, "tool_calls": tool_calls })
}

/// `timeout_cap_s` is the cap the call actually ran under, kept so a replay
/// can re-run it with the same bound.
pub fn tool_payload(
    name: &str,
    arguments: &Value,
    result: &Value,
    timeout_cap_s: Option<f64>,
) -> Value {
    let mut payload = json!({ "name": name, "arguments": arguments, "result": result });
    if let Some(cap) = timeout_cap_s {
        payload["timeout_cap_s"] = json!(cap);
    }
    payload
}

/// Payload of the closing `outcome` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub success: bool,
    pub score: f64,
    pub reason: String,
    pub outcome: String,
    pub duration_s: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lines_are_flushed_as_they_are_logged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join(trajectory_file_name("t1"));
        let mut writer = TrajectoryWriter::create(&path).unwrap();

        writer
            .log(EventType::Message, message_payload(Role::Assistant, "hi", &[]))
            .unwrap();
        // Still open: the line must already be on disk
        let on_disk = load_trajectory(&path).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].payload, writer.events()[0].payload);
        assert_eq!(on_disk[0].kind, EventType::Message);
    }

    #[test]
    fn serialized_keys_are_sorted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        let mut writer = TrajectoryWriter::create(&path).unwrap();
        writer
            .log(EventType::Tool, tool_payload("terminal.exec", &json!({"cmd": "ls"}), &json!({}), None))
            .unwrap();

        let line = fs::read_to_string(&path).unwrap();
        let keys = ["\"payload\"", "\"schema_version\"", "\"timestamp\"", "\"type\""];
        let positions: Vec<usize> = keys.iter().map(|k| line.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{line}");
        assert!(line.contains("\"schema_version\":\"1.0\""));
        assert!(line.contains("\"type\":\"tool\""));
    }

    #[test]
    fn create_replaces_a_previous_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        for _ in 0..2 {
            let mut writer = TrajectoryWriter::create(&path).unwrap();
            writer.log(EventType::Config, json!({})).unwrap();
            writer.log(EventType::Outcome, json!({})).unwrap();
        }
        assert_eq!(load_trajectory(&path).unwrap().len(), 2);
    }

    #[test]
    fn reader_skips_blank_lines_and_tolerates_extra_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(
            &path,
            "\n{\"schema_version\":\"1.0\",\"timestamp\":1.5,\"type\":\"config\",\"payload\":{},\"host\":\"ci\"}\n  \n",
        )
        .unwrap();
        let events = load_trajectory(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventType::Config);
        assert_eq!(events[0].timestamp, 1.5);
    }

    #[test]
    fn malformed_line_fails_with_its_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(
            &path,
            "{\"schema_version\":\"1.0\",\"timestamp\":1,\"type\":\"config\",\"payload\":{}}\n{not json\n",
        )
        .unwrap();
        let err = load_trajectory(&path).unwrap_err();
        match err.downcast_ref::<AgentboxError>() {
            Some(AgentboxError::MalformedTrajectory { line, .. }) => assert_eq!(*line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(
            &path,
            "{\"schema_version\":\"1.0\",\"timestamp\":1,\"type\":\"debug\",\"payload\":{}}\n",
        )
        .unwrap();
        assert!(load_trajectory(&path).is_err());
    }

    #[test]
    fn outcome_record_has_the_recorded_fields() {
        let record = OutcomeRecord {
            success: true,
            score: 1.0,
            reason: "assistant reported success".to_string(),
            outcome: "succeeded".to_string(),
            duration_s: 2.5,
        };
        let value = serde_json::to_value(&record).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["duration_s", "outcome", "reason", "score", "success"]);
    }
}
