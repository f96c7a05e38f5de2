//! ToolContext - execution context for tools

use std::path::{Path, PathBuf};

use super::ToolError;

/// Execution context for tools - scoped to a single task
///
/// File operations are constrained to the task's worktree. This provides
/// sandboxing - tools cannot escape the worktree unless it is explicitly
/// disabled.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Worktree path - all file ops constrained here
    pub worktree: PathBuf,

    /// Owning task id
    pub task_id: String,

    /// Session id for output correlation
    pub session_id: String,

    /// Whether sandbox mode is enabled (default: true)
    pub sandbox_enabled: bool,
}

impl ToolContext {
    pub fn new(worktree: PathBuf, task_id: String, session_id: String) -> Self {
        Self {
            worktree,
            task_id,
            session_id,
            sandbox_enabled: true,
        }
    }

    /// Create a context with sandbox disabled (for testing)
    pub fn new_unsandboxed(worktree: PathBuf, task_id: String, session_id: String) -> Self {
        Self {
            worktree,
            task_id,
            session_id,
            sandbox_enabled: false,
        }
    }

    /// Normalize a path relative to the worktree
    fn normalize_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.worktree.join(path) }
    }

    /// Validate a path is within the worktree (sandbox enforcement)
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, ToolError> {
        let normalized = self.normalize_path(path);

        if !self.sandbox_enabled {
            return Ok(normalized);
        }

        // Canonicalize existing paths to resolve symlinks; for paths that do
        // not exist yet, canonicalize the nearest existing parent instead.
        let canonical = if normalized.exists() {
            normalized.canonicalize().unwrap_or_else(|_| normalized.clone())
        } else if let Some(parent) = normalized.parent() {
            if parent.exists() {
                let canonical_parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
                canonical_parent.join(normalized.file_name().unwrap_or_default())
            } else {
                normalized.clone()
            }
        } else {
            normalized.clone()
        };

        let worktree_canonical = self.worktree.canonicalize().unwrap_or_else(|_| self.worktree.clone());

        if canonical.starts_with(&worktree_canonical) {
            Ok(canonical)
        } else {
            Err(ToolError::SandboxViolation {
                path: path.to_path_buf(),
                worktree: self.worktree.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(worktree: &Path) -> ToolContext {
        ToolContext::new(worktree.to_path_buf(), "task".to_string(), "session".to_string())
    }

    #[test]
    fn test_relative_path_within_worktree() {
        let temp = tempdir().unwrap();
        let ctx = ctx(temp.path());

        let path = ctx.validate_path(Path::new("file.txt")).unwrap();
        assert!(path.starts_with(temp.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_absolute_path_outside_worktree_rejected() {
        let temp = tempdir().unwrap();
        let ctx = ctx(temp.path());

        let result = ctx.validate_path(Path::new("/etc/passwd"));
        assert!(matches!(result, Err(ToolError::SandboxViolation { .. })));
    }

    #[test]
    fn test_traversal_rejected() {
        let temp = tempdir().unwrap();
        let ctx = ctx(temp.path());

        let result = ctx.validate_path(Path::new("../../etc/passwd"));
        assert!(matches!(result, Err(ToolError::SandboxViolation { .. })));
    }

    #[test]
    fn test_unsandboxed_allows_outside_paths() {
        let temp = tempdir().unwrap();
        let ctx = ToolContext::new_unsandboxed(temp.path().to_path_buf(), "t".to_string(), "s".to_string());

        assert!(ctx.validate_path(Path::new("/etc/passwd")).is_ok());
    }
}
