//! Live task sessions and output fan-out

mod registry;

pub use registry::{SessionRegistry, Subscription};

use bytes::Bytes;

/// Error types for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session not running: {0}")]
    NotRunning(String),
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    /// Clean completion: zero exit code or clean loop termination
    Completed,
    /// Non-zero exit or unhandled runner error
    Failed,
    /// Explicit terminate/kill
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

/// Event delivered to session subscribers
///
/// Every subscriber sees the same total order from its join point onward;
/// the buffered prefix arrives as a single `Replay` before the live tail.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Buffered output replayed on subscription. `truncated` marks that the
    /// oldest chunks were dropped to honour the buffer limit.
    Replay { data: Bytes, truncated: bool },

    /// A live chunk of combined output
    Output { data: Bytes },

    /// The underlying process exited with this code
    Exit { code: i32 },

    /// Final event: the session reached a terminal state
    Terminated { status: SessionStatus },
}

/// Snapshot returned by `info`
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub status: SessionStatus,
    /// Cumulative output bytes appended over the session's lifetime
    pub output_bytes: u64,
    pub exit_code: Option<i32>,
}
