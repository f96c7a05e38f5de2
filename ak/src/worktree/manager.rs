//! Worktree manager for creating, inspecting, and garbage-collecting
//! per-task git worktrees

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::CommitSummary;

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Worktree path already occupied: {0}")]
    WorktreeConflict(String),

    #[error("Base branch not resolvable: {0}")]
    BaseMissing(String),

    #[error("Worktree already exists for task: {0}")]
    AlreadyExists(String),

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Status of a tracked worktree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeStatus {
    Active,
    Completed,
    Failed,
    /// Found on disk without a live task; set only by startup reconciliation
    Orphaned,
}

impl WorktreeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Directory holding per-task worktrees
    pub base_dir: PathBuf,

    /// Path to the base repository
    pub repo_root: PathBuf,

    /// Branch prefix for task branches
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/agentkit/worktrees"),
            repo_root: PathBuf::from("."),
            branch_prefix: "agentkit".to_string(),
        }
    }
}

/// Information about a tracked worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
}

struct TrackedWorktree {
    branch: String,
    base_branch: String,
    status: WorktreeStatus,
    last_activity: Instant,
}

/// Manager for per-task git worktrees
///
/// Each running task owns exactly one worktree; all mutation goes through
/// this manager. `git worktree add` runs under an internal lock because
/// concurrent adds race on the repository index lock.
pub struct WorktreeManager {
    config: WorktreeConfig,
    tracked: Arc<Mutex<HashMap<String, TrackedWorktree>>>,
    /// Serialises mutating git operations against the base repository
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self {
            config,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a worktree for a task off `base_branch`
    ///
    /// Concurrent creates for the same task id fail the second caller with
    /// `AlreadyExists`. A failed create leaves no partial state on disk.
    pub async fn create(&self, task_id: &str, base_branch: &str) -> Result<PathBuf, WorktreeError> {
        debug!(%task_id, %base_branch, "WorktreeManager::create: called");

        let worktree_path = self.worktree_path(task_id);
        let branch_name = self.branch_name(task_id);

        // Reserve the task id first so a racing create fails fast
        {
            let mut tracked = self.tracked.lock().await;
            if tracked.contains_key(task_id) {
                return Err(WorktreeError::AlreadyExists(task_id.to_string()));
            }
            tracked.insert(
                task_id.to_string(),
                TrackedWorktree {
                    branch: branch_name.clone(),
                    base_branch: base_branch.to_string(),
                    status: WorktreeStatus::Active,
                    last_activity: Instant::now(),
                },
            );
        }

        match self.create_on_disk(task_id, base_branch, &worktree_path, &branch_name).await {
            Ok(()) => {
                info!(%task_id, path = %worktree_path.display(), branch = %branch_name, "Created worktree");
                Ok(worktree_path)
            }
            Err(e) => {
                // Roll back the reservation and any partial disk state
                self.tracked.lock().await.remove(task_id);
                let _ = tokio::fs::remove_dir_all(&worktree_path).await;
                Err(e)
            }
        }
    }

    async fn create_on_disk(
        &self,
        task_id: &str,
        base_branch: &str,
        worktree_path: &PathBuf,
        branch_name: &str,
    ) -> Result<(), WorktreeError> {
        if worktree_path.exists() {
            return Err(WorktreeError::WorktreeConflict(worktree_path.display().to_string()));
        }

        // One local retry on transient filesystem errors
        if let Err(first) = tokio::fs::create_dir_all(&self.config.base_dir).await {
            warn!(error = %first, "WorktreeManager::create: base dir creation failed, retrying once");
            tokio::fs::create_dir_all(&self.config.base_dir)
                .await
                .map_err(|e| WorktreeError::CreateFailed(format!("Failed to create base dir: {}", e)))?;
        }

        // Verify the base branch resolves before touching the repo
        let verify = self
            .git(&["rev-parse", "--verify", "--quiet", base_branch], &self.config.repo_root)
            .await?;
        if !verify.status.success() {
            return Err(WorktreeError::BaseMissing(base_branch.to_string()));
        }

        // Concurrent `git worktree add` races on the index lock; serialise
        let _guard = self.git_lock.lock().await;
        let output = self
            .git(
                &[
                    "worktree",
                    "add",
                    worktree_path.to_str().unwrap_or_default(),
                    "-b",
                    branch_name,
                    base_branch,
                ],
                &self.config.repo_root,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(%task_id, %stderr, "WorktreeManager::create: git worktree add failed");
            return Err(WorktreeError::CreateFailed(stderr.to_string()));
        }

        Ok(())
    }

    /// Commits reachable from the task branch but not from the base branch
    ///
    /// Topological order, oldest first.
    pub async fn commits_on_branch(&self, task_id: &str, base_branch: &str) -> Result<Vec<CommitSummary>, WorktreeError> {
        debug!(%task_id, %base_branch, "WorktreeManager::commits_on_branch: called");
        let branch = self.branch_name(task_id);

        let output = self
            .git(
                &[
                    "log",
                    "--reverse",
                    "--topo-order",
                    "--format=%h%x09%s",
                    &format!("{}..{}", base_branch, branch),
                ],
                &self.config.repo_root,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::GitError(stderr.to_string()));
        }

        let commits = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let (id, summary) = line.split_once('\t')?;
                Some(CommitSummary {
                    id: id.to_string(),
                    summary: summary.to_string(),
                })
            })
            .collect();

        Ok(commits)
    }

    /// Set of paths changed on the task branch relative to the base branch
    pub async fn changed_files(&self, task_id: &str, base_branch: &str) -> Result<Vec<String>, WorktreeError> {
        debug!(%task_id, %base_branch, "WorktreeManager::changed_files: called");
        let branch = self.branch_name(task_id);

        let output = self
            .git(
                &["diff", "--name-only", &format!("{}...{}", base_branch, branch)],
                &self.config.repo_root,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::GitError(stderr.to_string()));
        }

        let mut files: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        files.sort();
        files.dedup();

        Ok(files)
    }

    /// Update bookkeeping status for a task's worktree
    pub async fn update_status(&self, task_id: &str, status: WorktreeStatus) -> Result<(), WorktreeError> {
        debug!(%task_id, ?status, "WorktreeManager::update_status: called");
        let mut tracked = self.tracked.lock().await;
        let entry = tracked
            .get_mut(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;
        entry.status = status;
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Tear down a task's worktree
    ///
    /// With `keep_branch` the branch stays discoverable by name after the
    /// directory is gone. Safe to call on an already-removed worktree.
    pub async fn cleanup(&self, task_id: &str, keep_branch: bool) -> Result<(), WorktreeError> {
        debug!(%task_id, keep_branch, "WorktreeManager::cleanup: called");
        let worktree_path = self.worktree_path(task_id);
        let branch_name = self.branch_name(task_id);

        let _guard = self.git_lock.lock().await;

        if worktree_path.exists() {
            let output = self
                .git(
                    &[
                        "worktree",
                        "remove",
                        worktree_path.to_str().unwrap_or_default(),
                        "--force",
                    ],
                    &self.config.repo_root,
                )
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // Not registered with git (e.g. orphan dir); fall back to plain removal
                if stderr.contains("is not a working tree") {
                    let _ = tokio::fs::remove_dir_all(&worktree_path).await;
                } else {
                    return Err(WorktreeError::RemoveFailed(stderr.to_string()));
                }
            }
        } else {
            debug!(%task_id, "WorktreeManager::cleanup: directory already gone");
        }

        if !keep_branch {
            let _ = self.git(&["branch", "-D", &branch_name], &self.config.repo_root).await;
        }

        self.tracked.lock().await.remove(task_id);
        info!(%task_id, "Removed worktree");
        Ok(())
    }

    /// Sweep terminal worktrees idle for longer than `older_than`
    ///
    /// Never removes the worktree of a running task. Returns the count
    /// removed.
    pub async fn gc(&self, older_than: Duration) -> Result<usize, WorktreeError> {
        debug!(?older_than, "WorktreeManager::gc: called");

        // Orphans are eligible immediately; everything else must be terminal
        // and idle past the threshold.
        let is_eligible = |wt: &TrackedWorktree| {
            wt.status == WorktreeStatus::Orphaned
                || (wt.status.is_terminal() && wt.last_activity.elapsed() >= older_than)
        };

        let eligible: Vec<String> = {
            let tracked = self.tracked.lock().await;
            tracked
                .iter()
                .filter(|(_, wt)| is_eligible(wt))
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut cleaned = 0;
        for task_id in eligible {
            // Status may have changed since the scan; re-check under the lock
            let still_eligible = {
                let tracked = self.tracked.lock().await;
                tracked.get(&task_id).map(|wt| is_eligible(wt)).unwrap_or(false)
            };
            if !still_eligible {
                continue;
            }
            match self.cleanup(&task_id, false).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(%task_id, error = %e, "GC failed to remove worktree"),
            }
        }

        debug!(cleaned, "WorktreeManager::gc: completed");
        Ok(cleaned)
    }

    /// Reconcile on-disk worktrees against the set of live task ids
    ///
    /// Directories without a corresponding running task are marked orphaned
    /// and become GC-eligible. Called once at startup.
    pub async fn reconcile(&self, live_task_ids: &[String]) -> Result<usize, WorktreeError> {
        debug!(?live_task_ids, "WorktreeManager::reconcile: called");

        if !self.config.base_dir.exists() {
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::GitError(format!("Failed to read worktree base dir: {}", e)))?;

        let mut orphaned = 0;
        let mut tracked = self.tracked.lock().await;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(task_id) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            if live_task_ids.contains(&task_id) || tracked.contains_key(&task_id) {
                continue;
            }

            warn!(%task_id, "Found orphaned worktree, marking for GC");
            tracked.insert(
                task_id.clone(),
                TrackedWorktree {
                    branch: self.branch_name(&task_id),
                    base_branch: String::new(),
                    status: WorktreeStatus::Orphaned,
                    last_activity: Instant::now(),
                },
            );
            orphaned += 1;
        }

        info!(orphaned, "Worktree reconciliation complete");
        Ok(orphaned)
    }

    /// Snapshot of tracked worktrees, oldest submission first
    pub async fn list(&self) -> Vec<WorktreeInfo> {
        let tracked = self.tracked.lock().await;
        let mut infos: Vec<(Instant, WorktreeInfo)> = tracked
            .iter()
            .map(|(id, wt)| {
                (
                    wt.last_activity,
                    WorktreeInfo {
                        task_id: id.clone(),
                        path: self.worktree_path(id),
                        branch: wt.branch.clone(),
                        base_branch: wt.base_branch.clone(),
                        status: wt.status,
                    },
                )
            })
            .collect();
        infos.sort_by_key(|(at, _)| *at);
        infos.into_iter().map(|(_, info)| info).collect()
    }

    /// Worktree directory for a task
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.config.base_dir.join(task_id)
    }

    /// Branch name derived from a task id
    pub fn branch_name(&self, task_id: &str) -> String {
        format!("{}/{}", self.config.branch_prefix, task_id)
    }

    /// Whether a worktree directory exists for this task
    pub fn exists(&self, task_id: &str) -> bool {
        self.worktree_path(task_id).exists()
    }

    async fn git(&self, args: &[&str], cwd: &PathBuf) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }
}
