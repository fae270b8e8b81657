//! Docker/Podman sandbox: one throwaway container per command.
//!
//! The workspace lives on the host and is bind-mounted at [`CONTAINER_WORKDIR`],
//! so file operations go through the same path guard as the local backend.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::limits::ContainerLimits;
use super::process::{CommandOutput, run_with_timeout};
use super::{Sandbox, SandboxConfig};
use crate::config::ContainerRuntime;

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Parent directory for read-only allowlist mounts.
pub const ALLOWLIST_MOUNT_ROOT: &str = "/mnt/allow";

pub struct ContainerSandbox {
    config: SandboxConfig,
    runtime: ContainerRuntime,
    image: String,
    limits: ContainerLimits,
    workspace: Option<TempDir>,
}

impl ContainerSandbox {
    pub fn new(
        config: SandboxConfig,
        runtime: ContainerRuntime,
        image: String,
        limits: ContainerLimits,
    ) -> Self {
        Self {
            config,
            runtime,
            image,
            limits,
            workspace: None,
        }
    }

    /// Full argv (runtime binary first) for running `cmd` in a fresh container.
    pub fn build_run_args(&self, cmd: &str, container_name: &str) -> Result<Vec<String>> {
        let workspace = self.root()?;

        let mut args = vec![
            self.runtime.binary().to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];

        if !self.config.network_enabled {
            args.push("--network=none".to_string());
        }

        args.extend(self.limits.run_args());

        // User mapping so files written in the bind mount are not root-owned
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            args.push("--user".to_string());
            args.push(format!("{}:{}", uid, gid));
            args.push("--env".to_string());
            args.push("HOME=/tmp".to_string());
        }

        args.push("-v".to_string());
        args.push(format!("{}:{}", workspace.display(), CONTAINER_WORKDIR));
        args.push("-w".to_string());
        args.push(CONTAINER_WORKDIR.to_string());

        for (index, host_path) in self.config.allowlist_paths.iter().enumerate() {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:ro",
                host_path,
                allowlist_mount_point(index, host_path)
            ));
        }

        args.push(self.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(cmd.to_string());
        Ok(args)
    }

    fn remove_container(&self, name: &str) {
        debug!(container = %name, "removing timed-out container");
        match Command::new(self.runtime.binary())
            .args(["rm", "-f", name])
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    warn!(container = %name, stderr = %stderr.trim(), "failed to remove container");
                }
            }
            Err(e) => warn!(container = %name, error = %e, "failed to run container rm"),
        }
    }
}

/// Deterministic in-container path for the `index`-th allowlisted host path.
pub fn allowlist_mount_point(index: usize, host_path: &str) -> String {
    let base = Path::new(host_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!("{}/{}_{}", ALLOWLIST_MOUNT_ROOT, index, base)
}

fn container_name() -> String {
    let mut bytes = [0u8; 6];
    if getrandom::fill(&mut bytes).is_ok() {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        return format!("agentbox-{}", hex);
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("agentbox-{:x}{:x}", nanos, std::process::id())
}

impl Sandbox for ContainerSandbox {
    fn create_workspace(&mut self) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("agentbox-ctr-")
            .tempdir()
            .context("Failed to create sandbox workspace")?;
        debug!(workspace = %dir.path().display(), "sandbox:container workspace created");
        self.workspace = Some(dir);
        Ok(())
    }

    fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|d| d.path())
    }

    fn run_command(&self, cmd: &str, timeout_s: f64) -> Result<CommandOutput> {
        let name = container_name();
        let args = self.build_run_args(cmd, &name)?;
        debug!(runtime = self.runtime.binary(), container = %name, args = ?args, "spawning container");

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        run_with_timeout(command, timeout_s, || self.remove_container(&name))
            .with_context(|| format!("Failed to execute {} run", self.runtime.binary()))
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(dir) = self.workspace.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                warn!(workspace = %path, error = %e, "failed to remove sandbox workspace");
            }
        }
        Ok(())
    }

    fn describe(&self) -> Value {
        json!({
            "type": "container",
            "runtime": self.runtime.binary(),
            "image": self.image,
            "network_enabled": self.config.network_enabled,
            "allowlist_paths": self.config.allowlist_paths,
        })
    }
}

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentboxError;

    fn make_sandbox(config: SandboxConfig, limits: ContainerLimits) -> ContainerSandbox {
        let mut sandbox = ContainerSandbox::new(
            config,
            ContainerRuntime::Docker,
            "python:3.11-slim".to_string(),
            limits,
        );
        sandbox.create_workspace().unwrap();
        sandbox
    }

    #[test]
    fn run_args_disable_network_and_mount_workspace() {
        let sandbox = make_sandbox(SandboxConfig::default(), ContainerLimits::default());
        let args = sandbox.build_run_args("echo hi", "agentbox-test").unwrap();
        let workspace = sandbox.workspace().unwrap().display().to_string();

        assert_eq!(args[..2], ["docker", "run"]);
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&format!("{}:/work", workspace)));
        let w = args.iter().position(|a| a == "-w").unwrap();
        assert_eq!(args[w + 1], "/work");
        assert_eq!(args[args.len() - 4..], ["python:3.11-slim", "sh", "-c", "echo hi"]);
    }

    #[test]
    fn network_enabled_omits_network_flag() {
        let config = SandboxConfig {
            network_enabled: true,
            ..Default::default()
        };
        let sandbox = make_sandbox(config, ContainerLimits::default());
        let args = sandbox.build_run_args("true", "n").unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--network")));
    }

    #[test]
    fn one_allowlisted_path_yields_one_readonly_mount() {
        let config = SandboxConfig {
            allowlist_paths: vec!["/data/allow.txt".to_string()],
            ..Default::default()
        };
        let sandbox = make_sandbox(config, ContainerLimits::default());
        let args = sandbox.build_run_args("true", "n").unwrap();

        let ro_mounts: Vec<&String> = args.iter().filter(|a| a.ends_with(":ro")).collect();
        assert_eq!(ro_mounts.len(), 1);
        assert_eq!(ro_mounts[0], "/data/allow.txt:/mnt/allow/0_allow.txt:ro");
    }

    #[test]
    fn resource_limits_become_runtime_flags() {
        let limits = ContainerLimits {
            cpus: Some(1.5),
            memory_mb: Some(128),
        };
        let sandbox = make_sandbox(SandboxConfig::default(), limits);
        let args = sandbox.build_run_args("true", "n").unwrap();
        let cpus = args.iter().position(|a| a == "--cpus").unwrap();
        assert_eq!(args[cpus + 1], "1.5");
        let memory = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[memory + 1], "128m");
    }

    #[test]
    fn podman_runtime_is_first_argument() {
        let mut sandbox = ContainerSandbox::new(
            SandboxConfig::default(),
            ContainerRuntime::Podman,
            "img".to_string(),
            ContainerLimits::default(),
        );
        sandbox.create_workspace().unwrap();
        let args = sandbox.build_run_args("true", "n").unwrap();
        assert_eq!(args[0], "podman");
    }

    #[test]
    fn args_require_a_workspace() {
        let sandbox = ContainerSandbox::new(
            SandboxConfig::default(),
            ContainerRuntime::Docker,
            "img".to_string(),
            ContainerLimits::default(),
        );
        let err = sandbox.build_run_args("true", "n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentboxError>(),
            Some(AgentboxError::WorkspaceUninitialized)
        ));
    }

    #[test]
    fn file_operations_use_the_host_workspace() {
        let sandbox = make_sandbox(SandboxConfig::default(), ContainerLimits::default());
        sandbox.write_file("src/main.py", "print(1)").unwrap();
        assert_eq!(sandbox.read_file("src/main.py").unwrap(), "print(1)");
        assert!(sandbox.read_file("../../etc/passwd").is_err());
    }

    #[test]
    fn container_names_are_unique() {
        assert_ne!(container_name(), container_name());
        assert!(container_name().starts_with("agentbox-"));
    }

    #[test]
    fn describe_includes_image_and_allowlist() {
        let sandbox = make_sandbox(
            SandboxConfig {
                allowlist_paths: vec!["/opt/data".to_string()],
                ..Default::default()
            },
            ContainerLimits::default(),
        );
        let info = sandbox.describe();
        assert_eq!(info["type"], "container");
        assert_eq!(info["image"], "python:3.11-slim");
        assert_eq!(info["runtime"], "docker");
        assert_eq!(info["allowlist_paths"], json!(["/opt/data"]));
    }
}
