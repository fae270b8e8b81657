use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::AgentboxError;

/// A task definition as read from YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSpec {
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub goal: String,

    /// Shell commands run in the fresh workspace before the agent starts
    #[serde(default)]
    pub setup_steps: Vec<String>,

    #[serde(default)]
    pub success_criteria: SuccessCriteria,

    #[serde(default)]
    pub constraints: Constraints,

    #[serde(default)]
    pub scoring: BTreeMap<String, Value>,

    /// Container image overriding the configured one
    #[serde(default)]
    pub image: Option<String>,
}

impl TaskSpec {
    pub fn evaluation_text(&self) -> String {
        format!("Success criteria: {}", self.success_criteria.kind)
    }
}

/// Untyped success criteria block. See [`Criterion`] for the checked form.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SuccessCriteria {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Constraints {
    /// Overrides `sandbox.network_enabled`
    #[serde(default)]
    pub network: Option<bool>,

    /// Overrides `agent.time_limit_s`
    #[serde(default)]
    pub time_limit_s: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Criterion {
    CommandExitCode { command: String },
    FileContains { file: String, contains: String },
    RegexInStdout { command: String, regex: Regex },
    UnitTestsPass { command: String },
}

impl TryFrom<&SuccessCriteria> for Criterion {
    type Error = AgentboxError;

    fn try_from(raw: &SuccessCriteria) -> std::result::Result<Self, Self::Error> {
        let unsupported = || AgentboxError::UnsupportedCriteria(raw.kind.clone());
        let command = || raw.command.clone().filter(|c| !c.trim().is_empty());

        match raw.kind.as_str() {
            "command_exit_code" => Ok(Criterion::CommandExitCode {
                command: command().ok_or_else(unsupported)?,
            }),
            "file_contains" => Ok(Criterion::FileContains {
                file: raw.file.clone().ok_or_else(unsupported)?,
                contains: raw.contains.clone().ok_or_else(unsupported)?,
            }),
            "regex_in_stdout" => {
                let pattern = raw.regex.as_deref().ok_or_else(unsupported)?;
                let regex = Regex::new(pattern).map_err(|e| {
                    AgentboxError::UnsupportedCriteria(format!("invalid regex {}: {}", pattern, e))
                })?;
                Ok(Criterion::RegexInStdout {
                    command: command().ok_or_else(unsupported)?,
                    regex,
                })
            }
            "unit_tests_pass" => Ok(Criterion::UnitTestsPass {
                command: command().ok_or_else(unsupported)?,
            }),
            _ => Err(unsupported()),
        }
    }
}

pub fn load_task(path: &Path) -> Result<TaskSpec> {
    debug!(path = %path.display(), "task:load");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse task file {}", path.display()))
}

/// Every `*.yaml` task in `dir`, in file-name order.
pub fn load_tasks_from_dir(dir: &Path) -> Result<Vec<TaskSpec>> {
    let pattern = dir.join("*.yaml");
    let pattern = pattern
        .to_str()
        .with_context(|| format!("Task directory is not valid UTF-8: {}", dir.display()))?;

    let mut paths = glob::glob(pattern)
        .context("Invalid task glob pattern")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to enumerate task files")?;
    paths.sort();

    paths.iter().map(|p| load_task(p)).collect()
}
