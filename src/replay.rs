//! Reading back a trajectory: summaries and tool re-execution diffs.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::llm::parse_arguments;
use crate::sandbox::{BackendRequest, Sandbox, SandboxConfig};
use crate::tools::{ToolResult, dispatch_with_timeout};
use crate::trajectory::{EventType, TrajectoryEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    /// Assistant turns
    pub steps: usize,
    pub tool_calls: usize,
    pub outcome: String,
}

pub fn summarize(events: &[TrajectoryEvent]) -> ReplaySummary {
    let steps = events
        .iter()
        .filter(|e| e.kind == EventType::Message && e.payload["role"] == "assistant")
        .count();
    let tool_calls = events.iter().filter(|e| e.kind == EventType::Tool).count();
    let outcome = events
        .iter()
        .rev()
        .find(|e| e.kind == EventType::Outcome)
        .and_then(|e| {
            e.payload
                .get("outcome")
                .or_else(|| e.payload.get("reason"))
                .and_then(Value::as_str)
        })
        .unwrap_or("unknown")
        .to_string();
    ReplaySummary {
        steps,
        tool_calls,
        outcome,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub recorded: Value,
    pub replayed: Value,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: recorded={} replayed={}",
            self.field, self.recorded, self.replayed
        )
    }
}

/// Mismatches for the `index`-th recorded tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDiff {
    pub index: usize,
    pub name: String,
    pub differences: Vec<FieldDiff>,
}

/// Field name used when re-dispatch fails outright.
pub const DISPATCH_ERROR_FIELD: &str = "dispatch_error";

/// Re-issue every recorded tool call against `sandbox`, in order, and diff
/// the fresh raw results against the recorded ones. Calls that match exactly
/// produce no entry. Each call runs under its recorded timeout cap, or
/// `fallback_cap` for events recorded without one.
pub fn reexec_tools(
    events: &[TrajectoryEvent],
    sandbox: &dyn Sandbox,
    fallback_cap: Option<f64>,
) -> Vec<ToolDiff> {
    let mut diffs = Vec::new();
    for (index, event) in events
        .iter()
        .filter(|e| e.kind == EventType::Tool)
        .enumerate()
    {
        let name = event.payload["name"].as_str().unwrap_or_default();
        let recorded = &event.payload["result"];
        let cap = event.payload["timeout_cap_s"].as_f64().or(fallback_cap);
        let replayed = redispatch(sandbox, name, &event.payload["arguments"], cap);

        let differences = match replayed {
            Ok(result) => diff_fields(recorded, &result.raw),
            Err(e) => {
                let failed = ToolResult::from_error(name, &e);
                if failed.raw == *recorded {
                    Vec::new()
                } else {
                    vec![FieldDiff {
                        field: DISPATCH_ERROR_FIELD.to_string(),
                        recorded: recorded.clone(),
                        replayed: failed.raw["error"].clone(),
                    }]
                }
            }
        };

        debug!(index, tool = name, differences = differences.len(), "replay:tool compared");
        if !differences.is_empty() {
            diffs.push(ToolDiff {
                index,
                name: name.to_string(),
                differences,
            });
        }
    }
    info!(mismatched = diffs.len(), "replay:reexec finished");
    diffs
}

fn redispatch(
    sandbox: &dyn Sandbox,
    name: &str,
    arguments: &Value,
    timeout_cap: Option<f64>,
) -> Result<ToolResult> {
    // Unparseable model arguments are recorded verbatim as a string
    let arguments = match arguments {
        Value::String(raw) => parse_arguments(name, raw)?,
        other => other.clone(),
    };
    dispatch_with_timeout(sandbox, name, &arguments, timeout_cap)
}

/// Compare two results key by key. Non-object values compare as a whole.
fn diff_fields(recorded: &Value, replayed: &Value) -> Vec<FieldDiff> {
    match (recorded, replayed) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            keys.into_iter()
                .filter_map(|key| {
                    let left = a.get(key).unwrap_or(&Value::Null);
                    let right = b.get(key).unwrap_or(&Value::Null);
                    (left != right).then(|| FieldDiff {
                        field: key.clone(),
                        recorded: left.clone(),
                        replayed: right.clone(),
                    })
                })
                .collect()
        }
        _ if recorded == replayed => Vec::new(),
        _ => vec![FieldDiff {
            field: "result".to_string(),
            recorded: recorded.clone(),
            replayed: replayed.clone(),
        }],
    }
}

/// Payload of the first `config` event.
pub fn recorded_config(events: &[TrajectoryEvent]) -> Option<&Value> {
    events
        .iter()
        .find(|e| e.kind == EventType::Config)
        .map(|e| &e.payload)
}

/// How to rebuild the sandbox a trajectory was recorded in.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub backend: BackendRequest,
    pub image: Option<String>,
    pub sandbox: SandboxConfig,
    pub setup_steps: Vec<String>,
}

/// An explicit backend wins; `auto` follows the recorded sandbox type. The
/// image comes from `image_override`, else the recording. Network policy,
/// allowlist mounts and setup steps always come from the recording.
pub fn plan_replay(
    events: &[TrajectoryEvent],
    requested: BackendRequest,
    image_override: Option<&str>,
    setup_time_limit_s: u64,
) -> ReplayPlan {
    let null = Value::Null;
    let config = recorded_config(events).unwrap_or(&null);
    let sandbox = &config["sandbox"];

    let backend = match requested {
        BackendRequest::Auto => match sandbox["type"].as_str() {
            Some("local") => BackendRequest::Local,
            Some("container") | Some("docker") => BackendRequest::Container,
            _ => BackendRequest::Auto,
        },
        explicit => explicit,
    };

    let setup_steps = string_list(&config["task"]["setup_steps"]);

    ReplayPlan {
        backend,
        image: image_override
            .map(str::to_string)
            .or_else(|| sandbox["image"].as_str().map(str::to_string)),
        sandbox: SandboxConfig {
            network_enabled: sandbox["network_enabled"].as_bool().unwrap_or(false),
            allowlist_paths: string_list(&sandbox["allowlist_paths"]),
            time_limit_s: setup_time_limit_s,
        },
        setup_steps,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Give `sandbox` a fresh workspace and run the recorded setup steps in it.
pub fn prepare_sandbox(sandbox: &mut dyn Sandbox, plan: &ReplayPlan) -> Result<()> {
    sandbox.create_workspace()?;
    for step in &plan.setup_steps {
        let output = sandbox.run_command(step, plan.sandbox.time_limit_s as f64)?;
        if !output.success() {
            warn!(step = %step, exit_code = output.exit_code, "replay:setup step exited non-zero");
        }
    }
    Ok(())
}
