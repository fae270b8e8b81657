use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use anyhow::{Context, Result};

use crate::sandbox::limits::{ContainerLimits, ResourceLimits};
use crate::sandbox::{BackendRequest, DEFAULT_TIME_LIMIT_S, SandboxConfig};

/// Configuration for the chat model endpoint
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct LlmConfig {
    /// Program invoked once per chat request. Receives the request JSON on
    /// stdin and must print a response JSON on stdout.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments passed to `command`
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// Model name forwarded to the endpoint and recorded for provenance
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Default: 0.2
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Default: 1024
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds. Default: 120
    #[serde(default)]
    pub timeout_s: Option<f64>,

    /// Retries after the first failed attempt. Default: 3
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// First backoff delay, doubled after every failure. Default: 1.0
    #[serde(default)]
    pub initial_backoff_s: Option<f64>,
}

impl LlmConfig {
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn args(&self) -> Vec<&str> {
        self.args
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("default")
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.2)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(1024)
    }

    pub fn timeout_s(&self) -> f64 {
        self.timeout_s.unwrap_or(120.0)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn initial_backoff_s(&self) -> f64 {
        self.initial_backoff_s.unwrap_or(1.0)
    }
}

/// Agent loop bounds and prompt overrides
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct AgentSection {
    /// Default: 40
    #[serde(default)]
    pub max_steps: Option<u32>,

    /// Cap on tool executions per run. Default: 80
    #[serde(default)]
    pub max_turns: Option<u32>,

    /// Default: 60
    #[serde(default)]
    pub tool_timeout_s: Option<f64>,

    /// Token budget for the assembled context. Default: 8000
    #[serde(default)]
    pub context_max_tokens: Option<usize>,

    /// Working memory capacity. Default: 20
    #[serde(default)]
    pub memory_items: Option<usize>,

    /// Wall-clock limit for a whole run. Default: 600
    #[serde(default)]
    pub time_limit_s: Option<f64>,

    /// Template overriding the built-in system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Template overriding the built-in task prompt
    #[serde(default)]
    pub task_prompt: Option<String>,
}

/// Sandbox backend selection and resource limits
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SandboxSection {
    /// `auto`, `local`, or `container` (`docker` is accepted). Default: auto
    #[serde(default)]
    pub backend: Option<String>,

    /// Container runtime binary. Default: docker
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,

    /// Container image when no task image is given
    #[serde(default)]
    pub image: Option<String>,

    /// Default: false
    #[serde(default)]
    pub network_enabled: Option<bool>,

    /// Host paths mounted read-only into container sandboxes
    #[serde(default)]
    pub allowlist_paths: Option<Vec<String>>,

    /// Timeout for task setup steps. Default: 30
    #[serde(default)]
    pub time_limit_s: Option<u64>,

    /// RLIMIT_CPU for local commands. Default: 10
    #[serde(default)]
    pub cpu_time_s: Option<u64>,

    /// RLIMIT_AS for local commands, in MiB. Default: 512
    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub container_cpus: Option<f64>,

    #[serde(default)]
    pub container_memory_mb: Option<u64>,
}

/// Container runtime for the container backend
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

impl SandboxSection {
    pub fn backend(&self) -> Result<BackendRequest> {
        self.backend.as_deref().unwrap_or("auto").parse()
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime.unwrap_or_default()
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled.unwrap_or(false)
    }

    pub fn time_limit_s(&self) -> u64 {
        self.time_limit_s.unwrap_or(DEFAULT_TIME_LIMIT_S)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        ResourceLimits {
            cpu_time_s: self.cpu_time_s.unwrap_or(defaults.cpu_time_s),
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
        }
    }

    pub fn container_limits(&self) -> ContainerLimits {
        ContainerLimits {
            cpus: self.container_cpus,
            memory_mb: self.container_memory_mb,
        }
    }

    /// Build the immutable per-sandbox settings, letting task constraints
    /// override the network flag.
    pub fn sandbox_config(&self, network_override: Option<bool>) -> SandboxConfig {
        SandboxConfig {
            network_enabled: network_override.unwrap_or_else(|| self.network_enabled()),
            allowlist_paths: self.allowlist_paths.clone().unwrap_or_default(),
            time_limit_s: self.time_limit_s(),
        }
    }
}

/// Top-level run configuration, read from a YAML file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RunConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub sandbox: SandboxSection,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load from an optional path, falling back to defaults.
    pub fn load_or_default(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RunConfig::parse("").unwrap();
        assert_eq!(config.llm.temperature(), 0.2);
        assert_eq!(config.llm.max_retries(), 3);
        assert_eq!(config.sandbox.runtime(), ContainerRuntime::Docker);
        assert_eq!(config.sandbox.time_limit_s(), 30);
        assert!(!config.sandbox.network_enabled());
        assert_eq!(config.sandbox.backend().unwrap(), BackendRequest::Auto);
    }

    #[test]
    fn parses_nested_sections() {
        let yaml = r#"
llm:
  command: my-chat-shim
  model: small
  max_retries: 1
agent:
  max_steps: 5
  context_max_tokens: 600
sandbox:
  backend: docker
  runtime: podman
  image: python:3.12-slim
  allowlist_paths: ["/data/ref.txt"]
  memory_mb: 256
"#;
        let config = RunConfig::parse(yaml).unwrap();
        assert_eq!(config.llm.command(), Some("my-chat-shim"));
        assert_eq!(config.llm.model(), "small");
        assert_eq!(config.agent.max_steps, Some(5));
        assert_eq!(config.sandbox.backend().unwrap(), BackendRequest::Container);
        assert_eq!(config.sandbox.runtime(), ContainerRuntime::Podman);
        assert_eq!(config.sandbox.resource_limits().memory_mb, 256);
        assert_eq!(config.sandbox.resource_limits().cpu_time_s, 10);
    }

    #[test]
    fn task_network_constraint_overrides_config() {
        let section = SandboxSection {
            network_enabled: Some(false),
            ..Default::default()
        };
        assert!(section.sandbox_config(Some(true)).network_enabled);
        assert!(!section.sandbox_config(None).network_enabled);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let section = SandboxSection {
            backend: Some("firecracker".to_string()),
            ..Default::default()
        };
        let err = section.backend().unwrap_err();
        assert!(err.to_string().contains("firecracker"));
    }

    #[test]
    fn blank_llm_command_counts_as_unset() {
        let llm = LlmConfig {
            command: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(llm.command(), None);
    }
}
