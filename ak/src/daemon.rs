//! Runtime assembly and the long-running daemon
//!
//! Everything is constructed here and passed down explicitly; no component
//! reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{info, warn};

use crate::agent::EngineConfig;
use crate::approval::{ApprovalBroker, ApprovalPolicy};
use crate::config::Config;
use crate::domain::CancelToken;
use crate::llm::{Provider, create_provider};
use crate::process::Supervisor;
use crate::router::{RouterSettings, TaskRouter};
use crate::runner::Runners;
use crate::rpc::{self, RpcState};
use crate::scheduler::{Schedule, ScheduleRule, Scheduler};
use crate::session::SessionRegistry;
use crate::state::{SnapshotStore, snapshot_loop};
use crate::tools::ToolExecutor;
use crate::worktree::{WorktreeConfig, WorktreeManager};

/// Fully wired runtime, ready to accept submissions
pub struct Runtime {
    pub router: TaskRouter,
    pub sessions: SessionRegistry,
    pub broker: ApprovalBroker,
    pub executor: Arc<ToolExecutor>,
    pub worktrees: Arc<WorktreeManager>,
    pub supervisor: Supervisor,
    pub config: Config,
}

impl Runtime {
    /// Build every component from configuration
    ///
    /// The provider is injected so tests and alternate frontends can swap in
    /// their own implementation.
    pub fn build(config: Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let policy = match &config.approval.policy_path {
            Some(path) => ApprovalPolicy::load(path)
                .context(format!("Failed to load approval policy from {}", path.display()))?,
            None => ApprovalPolicy::default(),
        };

        let supervisor = Supervisor::new();
        let sessions = SessionRegistry::new(supervisor.clone(), config.session.output_buffer_limit);
        let broker = ApprovalBroker::new(policy, Duration::from_secs(config.approval.decision_timeout_secs));
        let executor = Arc::new(ToolExecutor::standard(broker.clone()));

        let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: config.workspace.worktree_base.clone(),
            repo_root: config.workspace.workspace_root.clone(),
            branch_prefix: "agentkit".to_string(),
        }));

        let runners = Runners {
            provider,
            executor: executor.clone(),
            sessions: sessions.clone(),
            supervisor: supervisor.clone(),
            knowledge: None,
            engine_config: EngineConfig {
                max_turns: config.llm.max_turns,
                char_budget: config.llm.context_char_budget,
                max_tokens: config.llm.max_tokens,
                streaming: true,
            },
            external_cli: config.router.external_cli.clone(),
            external_args: config.router.external_cli_args.clone(),
        };

        let router = TaskRouter::new(
            RouterSettings {
                base_branch: config.workspace.base_branch.clone(),
                code_oriented_workspace: config.workspace.code_oriented,
                max_concurrent_tasks: config.router.max_concurrent_tasks as usize,
                default_timeout_secs: config.router.default_task_timeout_secs,
            },
            runners,
            worktrees.clone(),
            sessions.clone(),
            broker.clone(),
        );

        Ok(Self {
            router,
            sessions,
            broker,
            executor,
            worktrees,
            supervisor,
            config,
        })
    }

    /// Recover snapshot state and reconcile on-disk worktrees
    pub async fn recover(&self) -> Result<()> {
        let store = SnapshotStore::new(&self.config.rpc.snapshot_path);
        match store.load().await {
            Ok(tasks) => self.router.restore_tasks(tasks).await,
            Err(e) => warn!(error = %e, "Snapshot recovery failed, starting empty"),
        }

        let live = self.router.live_task_ids().await;
        match self.worktrees.reconcile(&live).await {
            Ok(orphaned) if orphaned > 0 => info!(orphaned, "Marked orphaned worktrees for GC"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Worktree reconciliation failed"),
        }

        Ok(())
    }

    /// RPC state for the HTTP surface
    pub fn rpc_state(&self) -> Arc<RpcState> {
        Arc::new(RpcState {
            router: self.router.clone(),
            sessions: self.sessions.clone(),
            executor: self.executor.clone(),
            broker: self.broker.clone(),
            worktrees: self.worktrees.clone(),
            gc_idle_age: Duration::from_secs(self.config.workspace.gc_idle_age_secs),
            repo_root: self.config.workspace.workspace_root.clone(),
            serve_git: self.config.rpc.serve_git,
        })
    }
}

/// Run the daemon until interrupted
pub async fn run(config: Config) -> Result<()> {
    let provider = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let runtime = Runtime::build(config, provider)?;
    runtime.recover().await?;

    let shutdown = CancelToken::new();

    // Periodic registry snapshots
    let snapshot_task = tokio::spawn(snapshot_loop(
        SnapshotStore::new(&runtime.config.rpc.snapshot_path),
        runtime.router.clone(),
        runtime.config.rpc.snapshot_interval_secs,
        shutdown.clone(),
    ));

    // Periodic worktree GC
    let gc_task = {
        let worktrees = runtime.worktrees.clone();
        let idle_age = Duration::from_secs(runtime.config.workspace.gc_idle_age_secs);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let tick = Duration::from_secs(15 * 60);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = cancel.cancelled() => break,
                }
                match worktrees.gc(idle_age).await {
                    Ok(0) => {}
                    Ok(cleaned) => info!(cleaned, "Worktree GC swept"),
                    Err(e) => warn!(error = %e, "Worktree GC failed"),
                }
            }
        })
    };

    // Scheduled submissions; bad patterns fail startup loudly
    let scheduler_task = if runtime.config.schedules.is_empty() {
        None
    } else {
        let mut schedules = Vec::with_capacity(runtime.config.schedules.len());
        for entry in &runtime.config.schedules {
            let rule = ScheduleRule::parse(&entry.pattern)
                .context(format!("Invalid schedule pattern '{}'", entry.pattern))?;
            let options = crate::router::SubmitOptions {
                runner: match entry.runner.as_str() {
                    "embedded" => crate::domain::RunnerSelection::Embedded,
                    "external-cli" => crate::domain::RunnerSelection::ExternalCli,
                    _ => crate::domain::RunnerSelection::Auto,
                },
                priority: entry.priority.parse().unwrap_or_default(),
                ..Default::default()
            };
            schedules.push(Schedule {
                rule,
                prompt: entry.prompt.clone(),
                options,
            });
        }
        let scheduler = Scheduler::new(runtime.router.clone(), schedules);
        Some(tokio::spawn(scheduler.run(shutdown.clone())))
    };

    // Ctrl-C flips the shutdown token
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let bind = runtime.config.rpc.bind.clone();
    rpc::serve(runtime.rpc_state(), &bind, shutdown.clone()).await?;

    shutdown.cancel();
    let _ = snapshot_task.await;
    let _ = gc_task.await;
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    info!("Daemon stopped");
    Ok(())
}
