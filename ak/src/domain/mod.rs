//! Core domain types shared across the runtime

mod cancel;
mod id;
mod priority;
mod task;

pub use cancel::CancelToken;
pub use id::{generate_task_id, short_request_id};
pub use priority::Priority;
pub use task::{
    CommitSummary, FailureKind, RunnerKind, RunnerSelection, Task, TaskFailure, TaskOutcome, TaskStatus,
    TranscriptMessage, TranscriptRole,
};
