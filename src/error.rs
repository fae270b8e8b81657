//! Error taxonomy shared by the sandbox, tool, and trajectory layers.
//!
//! Everything is raised through `anyhow`; callers that need to branch on a
//! specific failure use `err.downcast_ref::<AgentboxError>()`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AgentboxError {
    /// A path argument resolved outside the workspace root.
    #[error("Path traversal blocked: {0}")]
    PathViolation(String),

    #[error("Workspace not initialized; call create_workspace first")]
    WorkspaceUninitialized,

    #[error("{0} backend requested but its runtime is not available")]
    BackendUnavailable(String),

    #[error("Unsupported sandbox backend: {0}")]
    UnsupportedBackend(String),

    #[error("Unsupported success criteria: {0}")]
    UnsupportedCriteria(String),

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    /// A command timeout that cannot be represented as a duration.
    #[error("Invalid command timeout: {0}s")]
    InvalidTimeout(f64),

    #[error("Malformed trajectory {path} at line {line}: {reason}")]
    MalformedTrajectory {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// True if `err` carries the given taxonomy variant anywhere in its chain.
#[cfg(test)]
pub fn is_kind(err: &anyhow::Error, matches: impl Fn(&AgentboxError) -> bool) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<AgentboxError>())
        .any(matches)
}
