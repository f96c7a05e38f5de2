//! Child process supervision
//!
//! Launches external programs (coding CLIs, git, shortcut runners) under a
//! uniform contract: combined ordered output, timeout enforcement, graceful
//! terminate then forceful kill, and stdin injection for interactive
//! sessions.

mod supervisor;

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use supervisor::Supervisor;

/// Error types for supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("No running process for task: {0}")]
    NotRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a supervised process reached its end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Process exited on its own with this code
    Exited(i32),
    /// Deadline expired; the process was terminated by the supervisor
    TimedOut,
    /// An explicit cancel/kill terminated the process
    Terminated,
}

impl ExitKind {
    /// Exit code when the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitKind::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Exited(0))
    }
}

/// Event forwarded to a launch's progress channel
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A chunk of combined stdout/stderr, in the order it was read
    Output(Bytes),
    /// The process finished
    Exited(ExitKind),
}

/// Control characters that can be injected into a process's stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChar {
    /// Ctrl-C
    Interrupt,
    /// Ctrl-D
    Eof,
    /// Ctrl-Z
    Suspend,
    /// Ctrl-L
    ClearScreen,
}

impl ControlChar {
    pub fn as_byte(&self) -> u8 {
        match self {
            ControlChar::Interrupt => 0x03,
            ControlChar::Eof => 0x04,
            ControlChar::Suspend => 0x1a,
            ControlChar::ClearScreen => 0x0c,
        }
    }
}

/// Everything needed to launch one supervised process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable name or path; resolved against PATH when not a path
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment overrides
    pub env: HashMap<String, String>,
    /// Deadline for the whole run
    pub timeout: Option<Duration>,
    /// Bytes written to stdin immediately after spawn
    pub stdin_data: Option<Vec<u8>>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: None,
            stdin_data: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }
}

/// Result of a completed launch
#[derive(Debug)]
pub struct ProcessOutcome {
    pub exit: ExitKind,
    /// Full combined stdout/stderr transcript
    pub output: Vec<u8>,
}

impl ProcessOutcome {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}
