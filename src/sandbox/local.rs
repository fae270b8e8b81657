//! Bare-process sandbox: rlimited `bash -c` children in a temp workspace.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;
use tracing::{debug, trace, warn};

use super::limits::ResourceLimits;
use super::process::{CommandOutput, run_with_timeout};
use super::{Sandbox, SandboxConfig};

/// Proxy variables cleared when network access is disabled. This is a
/// best-effort deterrent, not a network namespace.
const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

pub struct LocalSandbox {
    config: SandboxConfig,
    limits: ResourceLimits,
    workspace: Option<TempDir>,
}

impl LocalSandbox {
    pub fn new(config: SandboxConfig, limits: ResourceLimits) -> Self {
        Self {
            config,
            limits,
            workspace: None,
        }
    }
}

impl Sandbox for LocalSandbox {
    fn create_workspace(&mut self) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("agentbox-")
            .tempdir()
            .context("Failed to create sandbox workspace")?;
        debug!(workspace = %dir.path().display(), "sandbox:local workspace created");
        if let Some(previous) = self.workspace.replace(dir) {
            debug!(workspace = %previous.path().display(), "sandbox:local previous workspace released");
        }
        Ok(())
    }

    fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|d| d.path())
    }

    fn run_command(&self, cmd: &str, timeout_s: f64) -> Result<CommandOutput> {
        let root = self.root()?;
        trace!(cmd, timeout_s, "sandbox:local run start");

        let mut command = Command::new("bash");
        command.arg("-c").arg(cmd).current_dir(root);

        if !self.config.network_enabled {
            for var in PROXY_VARS {
                command.env(var, "");
            }
            command.env("NO_PROXY", "*").env("no_proxy", "*");
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let limits = self.limits;
            unsafe {
                command.pre_exec(move || super::limits::apply_rlimits(&limits));
            }
        }

        run_with_timeout(command, timeout_s, || {})
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(dir) = self.workspace.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                warn!(workspace = %path, error = %e, "failed to remove sandbox workspace");
            } else {
                debug!(workspace = %path, "sandbox:local workspace removed");
            }
        }
        Ok(())
    }

    fn describe(&self) -> Value {
        json!({
            "type": "local",
            "network_enabled": self.config.network_enabled,
        })
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::AgentboxError;

    fn sandbox() -> LocalSandbox {
        let mut sandbox = LocalSandbox::new(SandboxConfig::default(), ResourceLimits::default());
        sandbox.create_workspace().unwrap();
        sandbox
    }

    #[test]
    fn write_then_read_round_trips() {
        let sandbox = sandbox();
        sandbox.write_file("safe.txt", "ok").unwrap();
        assert_eq!(sandbox.read_file("safe.txt").unwrap(), "ok");
    }

    #[test]
    fn escape_attempts_never_return_host_data() {
        let sandbox = sandbox();
        for path in ["../etc/passwd", "/etc/passwd", "a/../../etc/passwd"] {
            let err = sandbox.read_file(path).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<AgentboxError>(),
                    Some(AgentboxError::PathViolation(_))
                ),
                "{path}: {err:#}"
            );
        }
        assert!(sandbox.write_file("../outside.txt", "x").is_err());
        assert!(sandbox.list_dir("..").is_err());
    }

    #[test]
    fn write_creates_parent_directories_and_list_is_sorted() {
        let sandbox = sandbox();
        sandbox.write_file("pkg/b.txt", "b").unwrap();
        sandbox.write_file("pkg/a.txt", "a").unwrap();
        sandbox.write_file("pkg/sub/c.txt", "c").unwrap();
        assert_eq!(sandbox.list_dir("pkg").unwrap(), vec!["a.txt", "b.txt", "sub"]);
    }

    #[test]
    fn commands_run_in_the_workspace() {
        let sandbox = sandbox();
        sandbox.write_file("marker.txt", "here").unwrap();
        let out = sandbox.run_command("cat marker.txt", 10.0).unwrap();
        assert_eq!(out.stdout, "here");
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn proxies_are_cleared_without_network() {
        let sandbox = sandbox();
        let out = sandbox
            .run_command("printf '%s|%s' \"$HTTP_PROXY\" \"$NO_PROXY\"", 10.0)
            .unwrap();
        assert_eq!(out.stdout, "|*");
    }

    #[test]
    fn timeout_returns_result_instead_of_blocking() {
        let sandbox = sandbox();
        let out = sandbox.run_command("sleep 20", 0.5).unwrap();
        assert!(out.timed_out);
        assert_ne!(out.exit_code, 0);
    }

    #[test]
    fn operations_before_create_workspace_fail() {
        let sandbox = LocalSandbox::new(SandboxConfig::default(), ResourceLimits::default());
        let err = sandbox.run_command("true", 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentboxError>(),
            Some(AgentboxError::WorkspaceUninitialized)
        ));
        assert!(sandbox.read_file("x").is_err());
    }

    #[test]
    fn teardown_is_idempotent_and_removes_workspace() {
        let mut sandbox = sandbox();
        let path = sandbox.workspace().unwrap().to_path_buf();
        sandbox.teardown().unwrap();
        sandbox.teardown().unwrap();
        assert!(!path.exists());
        assert!(sandbox.workspace().is_none());
    }

    #[test]
    fn describe_reports_type_and_network() {
        let sandbox = sandbox();
        let info = sandbox.describe();
        assert_eq!(info["type"], "local");
        assert_eq!(info["network_enabled"], false);
    }
}
