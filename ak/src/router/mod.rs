//! Task router - entry point for every submission
//!
//! The router owns task records. It classifies the submission, provisions
//! the worktree and session, queues execution under the concurrency cap,
//! and drives the task record to its terminal state when the runner
//! finishes.

mod admission;
mod classify;

pub use admission::Admission;
pub use classify::{ClassifierScores, classify};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::approval::ApprovalBroker;
use crate::domain::{
    CancelToken, FailureKind, Priority, RunnerKind, RunnerSelection, Task, TaskFailure, TaskStatus, generate_task_id,
};
use crate::runner::{RunnerOutcome, Runners};
use crate::session::{SessionRegistry, SessionStatus};
use crate::worktree::{WorktreeManager, WorktreeStatus};

/// Error types for task submission
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid workspace reference: {0}")]
    InvalidWorkspace(String),

    #[error("Failed to provision task {task_id}: {message}")]
    Provisioning { task_id: String, message: String },
}

/// Options accompanying a submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub runner: RunnerSelection,
    pub workspace: Option<String>,
    pub priority: Priority,
    /// Deadline override in seconds; `None` uses the configured default
    pub timeout_secs: Option<u64>,
}

/// Router-level configuration
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub base_branch: String,
    pub code_oriented_workspace: bool,
    pub max_concurrent_tasks: usize,
    /// 0 disables the default deadline
    pub default_timeout_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            code_oriented_workspace: true,
            max_concurrent_tasks: 8,
            default_timeout_secs: 0,
        }
    }
}

/// Routes submissions to runners and owns the task table
#[derive(Clone)]
pub struct TaskRouter {
    settings: RouterSettings,
    tasks: Arc<Mutex<HashMap<String, Task>>>,
    cancels: Arc<Mutex<HashMap<String, CancelToken>>>,
    admission: Admission,
    runners: Runners,
    worktrees: Arc<WorktreeManager>,
    sessions: SessionRegistry,
    broker: ApprovalBroker,
}

impl TaskRouter {
    pub fn new(
        settings: RouterSettings,
        runners: Runners,
        worktrees: Arc<WorktreeManager>,
        sessions: SessionRegistry,
        broker: ApprovalBroker,
    ) -> Self {
        let admission = Admission::new(settings.max_concurrent_tasks);
        Self {
            settings,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            admission,
            runners,
            worktrees,
            sessions,
            broker,
        }
    }

    /// Submit a task
    ///
    /// Provisioning happens synchronously: a worktree and session exist when
    /// this returns. Execution waits for an admission slot. A provisioning
    /// failure leaves the task record in `failed` and surfaces the error.
    pub async fn submit(&self, prompt: &str, options: SubmitOptions) -> Result<String, SubmitError> {
        let workspace_path = self.resolve_workspace(options.workspace.as_deref())?;

        let task_id = generate_task_id(prompt);
        let (runner, scores) = match options.runner {
            RunnerSelection::Embedded => (
                RunnerKind::Embedded,
                ClassifierScores { code: 0, content: 0 },
            ),
            RunnerSelection::ExternalCli => (
                RunnerKind::ExternalCli,
                ClassifierScores { code: 0, content: 0 },
            ),
            RunnerSelection::Auto => classify(prompt, self.settings.code_oriented_workspace),
        };

        info!(
            %task_id,
            chosen_runner = %runner,
            code_score = scores.code,
            content_score = scores.content,
            "Task submitted"
        );

        let mut task = Task::new(task_id.clone(), prompt.to_string(), options.runner, runner, options.priority);
        task.workspace = workspace_path.map(|p| p.display().to_string());
        task.deadline_secs = options.timeout_secs.or_else(|| {
            (self.settings.default_timeout_secs > 0).then_some(self.settings.default_timeout_secs)
        });

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(task_id.clone(), task);
        }

        // Provision worktree and session up front so failures surface here
        if let Err(e) = self.worktrees.create(&task_id, &self.settings.base_branch).await {
            self.fail_task(&task_id, TaskFailure::new(FailureKind::SpawnFailed, e.to_string()))
                .await;
            return Err(SubmitError::Provisioning {
                task_id,
                message: e.to_string(),
            });
        }
        if let Err(e) = self.sessions.create_session(&task_id, runner).await {
            self.fail_task(&task_id, TaskFailure::new(FailureKind::Internal, e.to_string()))
                .await;
            return Err(SubmitError::Provisioning {
                task_id,
                message: e.to_string(),
            });
        }

        let cancel = CancelToken::new();
        self.cancels.lock().await.insert(task_id.clone(), cancel.clone());

        let router = self.clone();
        let drive_id = task_id.clone();
        let prompt = prompt.to_string();
        let priority = options.priority;
        tokio::spawn(async move {
            router.drive(drive_id, prompt, runner, priority, cancel).await;
        });

        Ok(task_id)
    }

    /// Execute one task to its terminal state
    async fn drive(&self, task_id: String, prompt: String, runner: RunnerKind, priority: Priority, cancel: CancelToken) {
        let slot = self.admission.acquire(priority).await;

        // Cancelled while queued: nothing ran, nothing to harvest
        if cancel.is_cancelled() {
            debug!(%task_id, "Task cancelled while queued");
            self.finish(&task_id, RunnerOutcome::Cancelled).await;
            slot.release().await;
            return;
        }

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(task) = tasks.get_mut(&task_id)
                && task.status.can_transition_to(TaskStatus::Running)
            {
                task.status = TaskStatus::Running;
            }
        }
        let _ = self.sessions.set_running(&task_id).await;

        let timeout = {
            let tasks = self.tasks.lock().await;
            tasks
                .get(&task_id)
                .and_then(|t| t.deadline_secs)
                .map(Duration::from_secs)
        };

        let worktree = self.worktrees.worktree_path(&task_id);
        let outcome = self
            .runners
            .run(&task_id, runner, &prompt, worktree, timeout, cancel)
            .await;

        self.finish(&task_id, outcome).await;
        slot.release().await;
    }

    /// Record a runner outcome: harvest artifacts, settle statuses
    async fn finish(&self, task_id: &str, outcome: RunnerOutcome) {
        debug!(%task_id, "TaskRouter::finish: called");

        // Harvest commits and changed files regardless of how the run ended
        let harvest = async {
            let commits = self.worktrees.commits_on_branch(task_id, &self.settings.base_branch).await.ok()?;
            let changed_files = self.worktrees.changed_files(task_id, &self.settings.base_branch).await.ok()?;
            Some(crate::domain::TaskOutcome { commits, changed_files })
        }
        .await;

        let (status, failure, transcript, session_status, worktree_status) = match outcome {
            RunnerOutcome::Completed { transcript } => (
                TaskStatus::Completed,
                None,
                transcript,
                SessionStatus::Completed,
                WorktreeStatus::Completed,
            ),
            RunnerOutcome::Cancelled => (
                TaskStatus::Cancelled,
                None,
                Vec::new(),
                SessionStatus::Terminated,
                WorktreeStatus::Failed,
            ),
            RunnerOutcome::Failed(failure) => (
                TaskStatus::Failed,
                Some(failure),
                Vec::new(),
                SessionStatus::Failed,
                WorktreeStatus::Failed,
            ),
        };

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(task) = tasks.get_mut(task_id) {
                // Terminal states are sinks
                if task.status.is_terminal() {
                    debug!(%task_id, "TaskRouter::finish: task already terminal");
                    return;
                }
                task.status = status;
                task.failure = failure;
                task.finished_at = Some(Utc::now());
                task.outcome = harvest;
                if !transcript.is_empty() {
                    // Runner transcripts start with the original user message
                    task.transcript = transcript;
                }
            }
        }

        let _ = self.sessions.mark_terminal(task_id, session_status).await;
        if let Err(e) = self.worktrees.update_status(task_id, worktree_status).await {
            debug!(%task_id, error = %e, "Worktree status update skipped");
        }
        self.cancels.lock().await.remove(task_id);

        info!(%task_id, ?status, "Task finished");
    }

    /// Force a task into `failed` (provisioning errors)
    async fn fail_task(&self, task_id: &str, failure: TaskFailure) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id)
            && !task.status.is_terminal()
        {
            task.status = TaskStatus::Failed;
            task.failure = Some(failure);
            task.finished_at = Some(Utc::now());
        }
    }

    /// Cancel a task
    ///
    /// Idempotent: cancelling a terminal task changes nothing and returns
    /// cleanly. Propagates to the loop flag, pending approvals, the child
    /// process, and the worktree status.
    pub async fn cancel(&self, task_id: &str) -> bool {
        debug!(%task_id, "TaskRouter::cancel: called");

        {
            let tasks = self.tasks.lock().await;
            match tasks.get(task_id) {
                None => return false,
                Some(task) if task.status.is_terminal() => {
                    debug!(%task_id, "TaskRouter::cancel: already terminal, no-op");
                    return true;
                }
                Some(_) => {}
            }
        }

        if let Some(cancel) = self.cancels.lock().await.get(task_id).cloned() {
            cancel.cancel();
        }
        self.broker.deny_all_for_task(task_id).await;
        // Graceful terminate; the supervisor escalates to kill on its own
        let _ = self.sessions.terminate(task_id).await;

        info!(%task_id, "Task cancellation requested");
        true
    }

    /// Look up a task by id
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// All tasks, oldest submission first
    pub async fn list_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.submitted_at);
        all
    }

    /// Whether a task has an approval waiting on a human
    pub async fn awaiting_approval(&self, task_id: &str) -> bool {
        !self.broker.pending_for_task(task_id).await.is_empty()
    }

    /// Restore terminal task records from a snapshot (startup recovery)
    pub async fn restore_tasks(&self, restored: Vec<Task>) {
        let mut tasks = self.tasks.lock().await;
        for task in restored {
            if task.status.is_terminal() {
                tasks.entry(task.id.clone()).or_insert(task);
            }
        }
    }

    /// Ids of tasks that are not terminal (for worktree reconciliation)
    pub async fn live_task_ids(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut ids: Vec<String> = tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn resolve_workspace(&self, workspace: Option<&str>) -> Result<Option<PathBuf>, SubmitError> {
        match workspace {
            None => Ok(None),
            Some(reference) => {
                let path = PathBuf::from(reference);
                if path.is_dir() {
                    Ok(Some(path))
                } else {
                    warn!(%reference, "Rejected unknown workspace reference");
                    Err(SubmitError::InvalidWorkspace(reference.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EngineConfig;
    use crate::approval::ApprovalPolicy;
    use crate::llm::mock::MockProvider;
    use crate::process::Supervisor;
    use crate::tools::ToolExecutor;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::process::Command;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    struct Fixture {
        router: TaskRouter,
        _repo: tempfile::TempDir,
        _base: tempfile::TempDir,
    }

    async fn fixture(provider: MockProvider, max_concurrent: usize) -> Fixture {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let supervisor = Supervisor::with_grace(Duration::from_millis(100));
        let sessions = SessionRegistry::new(supervisor.clone(), 1024 * 1024);
        let broker = ApprovalBroker::new(ApprovalPolicy::default(), Duration::from_secs(5));
        let worktrees = Arc::new(WorktreeManager::new(crate::worktree::WorktreeConfig {
            base_dir: base.path().to_path_buf(),
            repo_root: repo.path().to_path_buf(),
            branch_prefix: "test".to_string(),
        }));

        let runners = Runners {
            provider: Arc::new(provider),
            executor: Arc::new(ToolExecutor::standard(broker.clone())),
            sessions: sessions.clone(),
            supervisor,
            knowledge: None,
            engine_config: EngineConfig {
                streaming: false,
                ..Default::default()
            },
            external_cli: "echo".to_string(),
            external_args: vec![],
        };

        let router = TaskRouter::new(
            RouterSettings {
                base_branch: "main".to_string(),
                code_oriented_workspace: true,
                max_concurrent_tasks: max_concurrent,
                default_timeout_secs: 0,
            },
            runners,
            worktrees,
            sessions,
            broker,
        );

        Fixture {
            router,
            _repo: repo,
            _base: base,
        }
    }

    async fn wait_terminal(router: &TaskRouter, task_id: &str) -> Task {
        for _ in 0..200 {
            if let Some(task) = router.task(task_id).await
                && task.status.is_terminal()
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    #[tokio::test]
    async fn test_submit_and_complete_embedded() {
        let f = fixture(MockProvider::always_text("All done."), 4).await;

        let task_id = f
            .router
            .submit(
                "summarize the notes",
                SubmitOptions {
                    runner: RunnerSelection::Embedded,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = wait_terminal(&f.router, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.runner, RunnerKind::Embedded);
        assert_eq!(task.transcript.last().unwrap().text, "All done.");
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_invalid_workspace() {
        let f = fixture(MockProvider::always_text("x"), 4).await;

        let result = f
            .router
            .submit(
                "anything",
                SubmitOptions {
                    workspace: Some("/definitely/not/a/dir".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(result, Err(SubmitError::InvalidWorkspace(_))));
    }

    #[tokio::test]
    async fn test_auto_classification_recorded() {
        let f = fixture(MockProvider::always_text("ok"), 4).await;

        let task_id = f
            .router
            .submit("draft a blog post about ducks", SubmitOptions::default())
            .await
            .unwrap();

        let task = f.router.task(&task_id).await.unwrap();
        assert_eq!(task.requested, RunnerSelection::Auto);
        assert_eq!(task.runner, RunnerKind::Embedded);
        wait_terminal(&f.router, &task_id).await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_terminal() {
        let f = fixture(MockProvider::always_text("x"), 1).await;

        // Occupy the only slot with a slow external task so the second
        // submission stays queued.
        let mut runners = f.router.runners.clone();
        runners.external_cli = "sleep".to_string();
        let router = TaskRouter {
            runners,
            ..f.router.clone()
        };

        let blocker = router
            .submit(
                "2",
                SubmitOptions {
                    runner: RunnerSelection::ExternalCli,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let queued = router
            .submit(
                "queued work",
                SubmitOptions {
                    runner: RunnerSelection::Embedded,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(router.cancel(&queued).await);
        let task = wait_terminal(&router, &queued).await;
        assert_eq!(task.status, TaskStatus::Cancelled);

        // Second cancel: clean no-op, state unchanged
        assert!(router.cancel(&queued).await);
        let task = router.task(&queued).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        // The blocker is unaffected by the other task's cancellation
        router.cancel(&blocker).await;
        wait_terminal(&router, &blocker).await;
        assert!(!router.cancel("no-such-task").await);
    }

    #[tokio::test]
    async fn test_concurrency_cap_queues_submissions() {
        let f = fixture(MockProvider::always_text("done"), 1).await;

        let first = f
            .router
            .submit(
                "0.5",
                SubmitOptions {
                    runner: RunnerSelection::ExternalCli,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = f
            .router
            .submit(
                "quick note",
                SubmitOptions {
                    runner: RunnerSelection::Embedded,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let a = wait_terminal(&f.router, &first).await;
        let b = wait_terminal(&f.router, &second).await;
        assert!(a.status.is_terminal());
        assert!(b.status.is_terminal());
    }

    #[tokio::test]
    async fn test_harvest_after_external_commits() {
        let f = fixture(MockProvider::always_text("x"), 2).await;

        // The "coding CLI" here is sh, making two commits on the task branch
        let script = "git add -A >/dev/null 2>&1; \
                      echo one > a.txt && git add a.txt && git commit -q -m 'first change' && \
                      echo two > b.txt && git add b.txt && git commit -q -m 'second change'";

        // Swap the runner CLI for this test
        let mut runners = f.router.runners.clone();
        runners.external_cli = "sh".to_string();
        runners.external_args = vec!["-c".to_string()];
        let router = TaskRouter {
            runners,
            ..f.router.clone()
        };

        let task_id = router
            .submit(
                script,
                SubmitOptions {
                    runner: RunnerSelection::ExternalCli,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = wait_terminal(&router, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);

        let outcome = task.outcome.expect("harvest should run");
        assert_eq!(outcome.commits.len(), 2);
        assert_eq!(outcome.commits[0].summary, "first change");
        assert_eq!(outcome.commits[1].summary, "second change");
        assert_eq!(outcome.changed_files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_live_task_ids_excludes_terminal() {
        let f = fixture(MockProvider::always_text("done"), 4).await;

        let task_id = f.router.submit("note", SubmitOptions::default()).await.unwrap();
        wait_terminal(&f.router, &task_id).await;

        assert!(f.router.live_task_ids().await.is_empty());
    }
}
