//! Resource caps for sandboxed commands.

use serde::{Deserialize, Serialize};

/// Per-process rlimits applied to local commands before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_time_s: u64,
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_s: 10,
            memory_mb: 512,
        }
    }
}

/// Runtime flags for container commands. Unset fields add no flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
}

impl ContainerLimits {
    pub fn run_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(cpus) = self.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory_mb) = self.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", memory_mb));
        }
        args
    }
}

/// Apply CPU-time and address-space limits to the calling process.
///
/// Runs in the forked child between fork and exec, so it must stay
/// async-signal-safe: no allocation, no locking.
#[cfg(unix)]
pub fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    let cpu = libc::rlimit {
        rlim_cur: limits.cpu_time_s as libc::rlim_t,
        rlim_max: limits.cpu_time_s as libc::rlim_t,
    };
    let memory_bytes = limits.memory_mb.saturating_mul(1024 * 1024);
    let address_space = libc::rlimit {
        rlim_cur: memory_bytes as libc::rlim_t,
        rlim_max: memory_bytes as libc::rlim_t,
    };

    unsafe {
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_AS, &address_space) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
