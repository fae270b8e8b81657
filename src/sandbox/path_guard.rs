//! Workspace path confinement.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::AgentboxError;

/// Resolve `relative` against `workspace_root`, rejecting anything that lands
/// outside the canonical root.
///
/// Existing path prefixes are canonicalized component by component so
/// symlinks are followed before the containment check; components that do
/// not exist yet (e.g. a file about to be written) are appended lexically.
/// A symlink that cannot be followed (dangling or looping) is a violation.
pub fn resolve(workspace_root: &Path, relative: &str) -> Result<PathBuf> {
    let root = workspace_root.canonicalize().with_context(|| {
        format!(
            "Failed to canonicalize workspace root {}",
            workspace_root.display()
        )
    })?;

    match resolve_lenient(&root.join(relative)) {
        Some(resolved) if resolved.starts_with(&root) => Ok(resolved),
        _ => Err(AgentboxError::PathViolation(relative.to_string()).into()),
    }
}

fn resolve_lenient(candidate: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if resolved.symlink_metadata().is_ok() {
                    resolved = resolved.canonicalize().ok()?;
                }
            }
        }
    }
    Some(resolved)
}
