//! Isolated workspaces with a confined command-execution surface.
//!
//! Two backends implement [`Sandbox`]: [`LocalSandbox`] runs commands as
//! rlimited host processes, [`ContainerSandbox`] runs each command in a
//! throwaway Docker/Podman container bound to the same host workspace.

pub mod container;
pub mod limits;
pub mod local;
pub mod path_guard;
pub mod process;

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ContainerRuntime, SandboxSection};
use crate::error::AgentboxError;

pub use container::ContainerSandbox;
pub use local::LocalSandbox;
pub use process::CommandOutput;

/// Image used by the container backend when neither task nor config name one.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Setup-step timeout when nothing else is configured.
pub const DEFAULT_TIME_LIMIT_S: u64 = 30;

/// Immutable per-sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub network_enabled: bool,
    /// Host paths bind-mounted read-only by the container backend
    pub allowlist_paths: Vec<String>,
    pub time_limit_s: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_enabled: false,
            allowlist_paths: Vec::new(),
            time_limit_s: DEFAULT_TIME_LIMIT_S,
        }
    }
}

/// Capability set shared by every backend.
///
/// File operations have provided implementations: both backends keep the
/// workspace on the host, so they only need [`Sandbox::workspace`].
pub trait Sandbox {
    /// Allocate a fresh, empty workspace, replacing any previous handle.
    fn create_workspace(&mut self) -> Result<()>;

    /// Host path of the current workspace, if one exists.
    fn workspace(&self) -> Option<&Path>;

    /// Run `cmd` through a shell with the workspace as working directory.
    fn run_command(&self, cmd: &str, timeout_s: f64) -> Result<CommandOutput>;

    /// Release the workspace. Calling it again is a no-op.
    fn teardown(&mut self) -> Result<()>;

    /// Provenance summary recorded in the trajectory `config` event.
    fn describe(&self) -> Value;

    fn root(&self) -> Result<&Path> {
        self.workspace()
            .ok_or_else(|| AgentboxError::WorkspaceUninitialized.into())
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let target = path_guard::resolve(self.root()?, path)?;
        fs::read_to_string(&target)
            .with_context(|| format!("Failed to read {}", path))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = path_guard::resolve(self.root()?, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directories for {}", path))?;
        }
        fs::write(&target, content).with_context(|| format!("Failed to write {}", path))
    }

    /// Entry names under `path`, sorted so listings are reproducible.
    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let target = path_guard::resolve(self.root()?, path)?;
        let mut entries = fs::read_dir(&target)
            .with_context(|| format!("Failed to list {}", path))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read entries of {}", path))?;
        entries.sort();
        Ok(entries)
    }
}

/// Backend requested by configuration or the replay CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendRequest {
    #[default]
    Auto,
    Local,
    Container,
}

impl FromStr for BackendRequest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendRequest::Auto),
            "local" => Ok(BackendRequest::Local),
            "container" | "docker" => Ok(BackendRequest::Container),
            other => Err(AgentboxError::UnsupportedBackend(other.to_string()).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Container,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Container => "container",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    pub kind: BackendKind,
    pub image: Option<String>,
}

/// Pick a backend. An explicit request wins; `auto` prefers containers when
/// the runtime exists. A container request never downgrades to local.
pub fn resolve_backend(
    request: BackendRequest,
    config_image: Option<&str>,
    task_image: Option<&str>,
    runtime_available: bool,
) -> Result<ResolvedBackend> {
    let image = || {
        Some(
            task_image
                .or(config_image)
                .unwrap_or(DEFAULT_IMAGE)
                .to_string(),
        )
    };

    match request {
        BackendRequest::Local => Ok(ResolvedBackend {
            kind: BackendKind::Local,
            image: None,
        }),
        BackendRequest::Container if !runtime_available => {
            Err(AgentboxError::BackendUnavailable("container".to_string()).into())
        }
        BackendRequest::Container => Ok(ResolvedBackend {
            kind: BackendKind::Container,
            image: image(),
        }),
        BackendRequest::Auto if runtime_available => Ok(ResolvedBackend {
            kind: BackendKind::Container,
            image: image(),
        }),
        BackendRequest::Auto => Ok(ResolvedBackend {
            kind: BackendKind::Local,
            image: None,
        }),
    }
}

/// Whether the container runtime binary is on PATH.
pub fn runtime_available(runtime: ContainerRuntime) -> bool {
    which::which(runtime.binary()).is_ok()
}

/// Build an (uninitialized) sandbox for the configured backend.
pub fn make_sandbox(
    section: &SandboxSection,
    config: SandboxConfig,
    request: BackendRequest,
    task_image: Option<&str>,
) -> Result<Box<dyn Sandbox>> {
    let runtime = section.runtime();
    let resolved = resolve_backend(
        request,
        section.image.as_deref(),
        task_image,
        runtime_available(runtime),
    )?;
    info!(backend = resolved.kind.as_str(), image = ?resolved.image, "sandbox:backend resolved");

    match resolved.kind {
        BackendKind::Local => Ok(Box::new(LocalSandbox::new(
            config,
            section.resource_limits(),
        ))),
        BackendKind::Container => {
            let image = resolved.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string());
            debug!(runtime = runtime.binary(), %image, "sandbox:container selected");
            Ok(Box::new(ContainerSandbox::new(
                config,
                runtime,
                image,
                section.container_limits(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_kind;

    #[test]
    fn auto_prefers_container_when_runtime_exists() {
        let resolved = resolve_backend(BackendRequest::Auto, None, None, true).unwrap();
        assert_eq!(resolved.kind, BackendKind::Container);
        assert_eq!(resolved.image.as_deref(), Some(DEFAULT_IMAGE));
    }

    #[test]
    fn auto_falls_back_to_local_without_runtime() {
        let resolved = resolve_backend(BackendRequest::Auto, Some("cfg"), None, false).unwrap();
        assert_eq!(resolved.kind, BackendKind::Local);
        assert_eq!(resolved.image, None);
    }

    #[test]
    fn container_request_never_downgrades() {
        let err = resolve_backend(BackendRequest::Container, None, None, false).unwrap_err();
        assert!(is_kind(&err, |e| matches!(
            e,
            AgentboxError::BackendUnavailable(_)
        )));
    }

    #[test]
    fn local_request_is_always_local() {
        let resolved = resolve_backend(BackendRequest::Local, Some("img"), None, true).unwrap();
        assert_eq!(resolved.kind, BackendKind::Local);
    }

    #[test]
    fn image_precedence_task_then_config_then_default() {
        let task = resolve_backend(BackendRequest::Auto, Some("cfg"), Some("task"), true).unwrap();
        assert_eq!(task.image.as_deref(), Some("task"));

        let cfg = resolve_backend(BackendRequest::Auto, Some("cfg"), None, true).unwrap();
        assert_eq!(cfg.image.as_deref(), Some("cfg"));
    }

    #[test]
    fn backend_request_parsing() {
        assert_eq!("AUTO".parse::<BackendRequest>().unwrap(), BackendRequest::Auto);
        assert_eq!("docker".parse::<BackendRequest>().unwrap(), BackendRequest::Container);
        assert_eq!("local".parse::<BackendRequest>().unwrap(), BackendRequest::Local);

        let err = "vm".parse::<BackendRequest>().unwrap_err();
        assert!(is_kind(&err, |e| matches!(
            e,
            AgentboxError::UnsupportedBackend(_)
        )));
    }

    #[test]
    fn default_config_leaves_setup_steps_time_to_run() {
        let config = SandboxConfig::default();
        assert_eq!(config.time_limit_s, DEFAULT_TIME_LIMIT_S);
        assert_eq!(
            SandboxSection::default().sandbox_config(None),
            config
        );
    }

    #[test]
    fn explicit_local_factory_builds_local_sandbox() {
        let sandbox = make_sandbox(
            &SandboxSection::default(),
            SandboxConfig::default(),
            BackendRequest::Local,
            None,
        )
        .unwrap();
        assert_eq!(sandbox.describe()["type"], "local");
    }
}
