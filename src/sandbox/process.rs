//! Bounded child-process execution shared by both backends.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::AgentboxError;

/// Exit code reported for a command killed at its wall-clock bound.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one sandboxed command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Structured form recorded in trajectories.
    pub fn to_raw(&self) -> Value {
        json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
        })
    }
}

/// Spawn `cmd` with piped output and wait at most `timeout_s` seconds.
///
/// On expiry the whole process group is killed, `on_timeout` runs (used by
/// the container backend to remove the container), and a timeout-flavoured
/// [`CommandOutput`] is returned instead of an error.
pub fn run_with_timeout(
    cmd: Command,
    timeout_s: f64,
    on_timeout: impl FnOnce(),
) -> Result<CommandOutput> {
    run_with_input(cmd, None, timeout_s, on_timeout)
}

/// Like [`run_with_timeout`], feeding `input` to the child's stdin.
pub fn run_with_input(
    mut cmd: Command,
    input: Option<&str>,
    timeout_s: f64,
    on_timeout: impl FnOnce(),
) -> Result<CommandOutput> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let timeout = Duration::try_from_secs_f64(timeout_s.max(0.0))
        .map_err(|_| AgentboxError::InvalidTimeout(timeout_s))?;

    let started = Instant::now();
    let mut child = cmd.spawn().context("Failed to spawn sandboxed command")?;
    let stdout_handle = spawn_pipe_reader(child.stdout.take());
    let stderr_handle = spawn_pipe_reader(child.stderr.take());
    let stdin_handle = input.and_then(|data| {
        let data = data.as_bytes().to_vec();
        child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                // EPIPE just means the child stopped reading
                let _ = stdin.write_all(&data);
            })
        })
    });

    let (status, timed_out) = match child
        .wait_timeout(timeout)
        .context("Failed to wait on sandboxed command")?
    {
        Some(status) => (status, false),
        None => {
            kill_group(&mut child);
            on_timeout();
            let status = child
                .wait()
                .context("Failed to reap sandboxed command after kill")?;
            (status, true)
        }
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let stdout = collect_pipe(stdout_handle);
    let mut stderr = collect_pipe(stderr_handle);
    let elapsed = started.elapsed().as_secs_f64();

    if timed_out {
        warn!(timeout_s, elapsed, "sandboxed command timed out");
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("command timed out after {:.1}s", timeout_s));
        return Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        });
    }

    let exit_code = exit_code(&status);
    debug!(exit_code, elapsed, "sandboxed command finished");
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        timed_out: false,
    })
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill() {
        debug!(error = %e, "child already exited before kill");
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
