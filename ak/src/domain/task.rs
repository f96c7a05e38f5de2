//! Task records and status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Priority;

/// Runner requested at submission time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerSelection {
    /// In-process LLM loop
    Embedded,
    /// Externally spawned coding CLI
    ExternalCli,
    /// Let the router classify the prompt
    #[default]
    Auto,
}

/// Runner actually chosen for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    Embedded,
    ExternalCli,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded => write!(f, "embedded"),
            Self::ExternalCli => write!(f, "external-cli"),
        }
    }
}

/// Task lifecycle status
///
/// Transitions are forward-only: `Pending -> Running -> terminal`.
/// Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is a sink
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is allowed
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Machine-readable failure kinds carried on terminal task records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    TimedOut,
    ProviderUnavailable,
    RateLimited,
    ContextExceeded,
    ModelNotFound,
    ToolLoopDetected,
    SpawnFailed,
    RunnerError,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TimedOut => "timed-out",
            Self::ProviderUnavailable => "provider-unavailable",
            Self::RateLimited => "rate-limited",
            Self::ContextExceeded => "context-exceeded",
            Self::ModelNotFound => "model-not-found",
            Self::ToolLoopDetected => "tool-loop-detected",
            Self::SpawnFailed => "spawn-failed",
            Self::RunnerError => "runner-error",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Terminal failure attached to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One commit produced on a task branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Abbreviated commit hash
    pub id: String,
    /// First line of the commit message
    pub summary: String,
}

/// Durable outputs harvested when a runner finishes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Commits on the task branch, topological order, oldest first
    pub commits: Vec<CommitSummary>,
    /// Union of files the task touched relative to the base branch
    pub changed_files: Vec<String>,
}

/// Role of a transcript message exposed over the remote protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// A message in the task's durable transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: TranscriptRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A submitted unit of work
///
/// Owned by the router; everything else refers to tasks by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    /// What the caller asked for
    pub requested: RunnerSelection,
    /// What the router chose
    pub runner: RunnerKind,
    pub workspace: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Populated only when status is `Failed`
    pub failure: Option<TaskFailure>,
    /// Populated when a runner exits after producing output
    pub outcome: Option<TaskOutcome>,
    pub transcript: Vec<TranscriptMessage>,
    /// Optional deadline in seconds from submission
    pub deadline_secs: Option<u64>,
}

impl Task {
    pub fn new(id: String, prompt: String, requested: RunnerSelection, runner: RunnerKind, priority: Priority) -> Self {
        Self {
            id,
            prompt: prompt.clone(),
            requested,
            runner,
            workspace: None,
            priority,
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
            finished_at: None,
            failure: None,
            outcome: None,
            transcript: vec![TranscriptMessage::user(prompt)],
            deadline_secs: None,
        }
    }
}
