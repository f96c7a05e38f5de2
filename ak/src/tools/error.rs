//! Tool error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the tool pipeline before a handler runs
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Path {path} escapes the worktree {worktree}")]
    SandboxViolation { path: PathBuf, worktree: PathBuf },
}
