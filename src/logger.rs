use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP_DIR: &str = "agentbox";
const LOG_FILE: &str = "agentbox.log";

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the file subscriber once; later calls are no-ops.
pub fn init() -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    init_inner()?;
    let _ = INIT.set(());
    Ok(())
}

fn init_inner() -> Result<()> {
    let log_path = log_path()?;
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(&log_path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// `$XDG_STATE_HOME/agentbox/agentbox.log`, else under `~/.local/state`,
/// else the current directory.
pub fn log_path() -> Result<PathBuf> {
    let state_home = std::env::var("XDG_STATE_HOME").ok();
    resolve_log_path(state_home.as_deref(), home::home_dir())
}

fn resolve_log_path(state_home: Option<&str>, home_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(state_home) = state_home
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home).join(APP_DIR).join(LOG_FILE));
    }

    if let Some(home_dir) = home_dir {
        return Ok(home_dir
            .join(".local")
            .join("state")
            .join(APP_DIR)
            .join(LOG_FILE));
    }

    Ok(std::env::current_dir()?.join(LOG_FILE))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_home_wins() {
        let path = resolve_log_path(Some("/state"), Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(path, PathBuf::from("/state/agentbox/agentbox.log"));
    }

    #[test]
    fn empty_state_home_falls_back_to_home() {
        let path = resolve_log_path(Some(""), Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(path, PathBuf::from("/home/u/.local/state/agentbox/agentbox.log"));
    }

    #[test]
    fn no_home_uses_current_dir() {
        let path = resolve_log_path(None, None).unwrap();
        assert_eq!(path, std::env::current_dir().unwrap().join("agentbox.log"));
    }

    #[test]
    fn split_path_separates_directory() {
        let path = PathBuf::from("/a/b/agentbox.log");
        let (dir, name) = split_path(&path).unwrap();
        assert_eq!(dir, PathBuf::from("/a/b"));
        assert_eq!(name, "agentbox.log");
    }
}
