//! Task runners: embedded agent loop and external coding CLI
//!
//! A runner takes a task from `running` to a terminal outcome. The router
//! owns the task record; runners only touch their session and worktree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{AgentEngine, EngineConfig, LoopOutcome};
use crate::domain::{CancelToken, FailureKind, RunnerKind, TaskFailure, TranscriptMessage};
use crate::knowledge::KnowledgeStore;
use crate::llm::Provider;
use crate::process::{ExitKind, LaunchSpec, ProcessEvent, Supervisor};
use crate::session::SessionRegistry;
use crate::tools::ToolExecutor;

/// Terminal result of one runner invocation
#[derive(Debug)]
pub enum RunnerOutcome {
    Completed { transcript: Vec<TranscriptMessage> },
    Cancelled,
    Failed(TaskFailure),
}

/// Shared dependencies for constructing runners
#[derive(Clone)]
pub struct Runners {
    pub provider: Arc<dyn Provider>,
    pub executor: Arc<ToolExecutor>,
    pub sessions: SessionRegistry,
    pub supervisor: Supervisor,
    pub knowledge: Option<Arc<dyn KnowledgeStore>>,
    pub engine_config: EngineConfig,
    /// External coding CLI binary and its leading arguments
    pub external_cli: String,
    pub external_args: Vec<String>,
}

impl Runners {
    /// Drive a task to completion with the selected runner
    pub async fn run(
        &self,
        task_id: &str,
        kind: RunnerKind,
        prompt: &str,
        worktree: PathBuf,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> RunnerOutcome {
        debug!(%task_id, %kind, ?timeout, "Runners::run: called");
        match kind {
            RunnerKind::Embedded => self.run_embedded(task_id, prompt, worktree, timeout, cancel).await,
            RunnerKind::ExternalCli => self.run_external(task_id, prompt, worktree, timeout, cancel).await,
        }
    }

    async fn run_embedded(
        &self,
        task_id: &str,
        prompt: &str,
        worktree: PathBuf,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> RunnerOutcome {
        let engine = AgentEngine::new(
            task_id.to_string(),
            self.provider.clone(),
            self.executor.clone(),
            self.sessions.clone(),
            self.knowledge.clone(),
            self.engine_config.clone(),
            cancel.clone(),
            worktree,
        );

        let outcome = match timeout {
            Some(t) => {
                tokio::select! {
                    outcome = engine.run(prompt) => outcome,
                    _ = tokio::time::sleep(t) => {
                        warn!(%task_id, ?t, "Embedded task deadline expired");
                        cancel.cancel();
                        return RunnerOutcome::Failed(TaskFailure::new(
                            FailureKind::TimedOut,
                            format!("task exceeded {}s deadline", t.as_secs()),
                        ));
                    }
                }
            }
            None => engine.run(prompt).await,
        };

        match outcome {
            LoopOutcome::Completed { transcript } => RunnerOutcome::Completed { transcript },
            LoopOutcome::Cancelled => RunnerOutcome::Cancelled,
            LoopOutcome::Failed(failure) => RunnerOutcome::Failed(failure),
        }
    }

    async fn run_external(
        &self,
        task_id: &str,
        prompt: &str,
        worktree: PathBuf,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> RunnerOutcome {
        let mut spec = LaunchSpec::new(&self.external_cli, worktree)
            .args(self.external_args.clone())
            .arg(prompt);
        if let Some(t) = timeout {
            spec = spec.timeout(t);
        }

        // Forward process output into the session as it arrives
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProcessEvent>(256);
        let sessions = self.sessions.clone();
        let forward_task_id = task_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                match event {
                    ProcessEvent::Output(data) => {
                        let _ = sessions.append_output(&forward_task_id, data).await;
                    }
                    ProcessEvent::Exited(kind) => {
                        let code = kind.code().unwrap_or(-1);
                        let _ = sessions.mark_exited(&forward_task_id, code).await;
                    }
                }
            }
        });

        // Cancel propagation: the watcher terminates the child
        let supervisor = self.supervisor.clone();
        let watch_task_id = task_id.to_string();
        let watch_cancel = cancel.clone();
        let watcher = tokio::spawn(async move {
            watch_cancel.cancelled().await;
            supervisor.cancel(&watch_task_id).await;
        });

        let result = self.supervisor.launch(task_id, spec, Some(progress_tx)).await;

        watcher.abort();
        let _ = forwarder.await;

        let outcome = match result {
            Err(e) => {
                warn!(%task_id, error = %e, "External runner failed to launch");
                RunnerOutcome::Failed(TaskFailure::new(FailureKind::SpawnFailed, e.to_string()))
            }
            Ok(outcome) => {
                let output_text = outcome.output_lossy();
                match outcome.exit {
                    ExitKind::Exited(0) => {
                        info!(%task_id, "External runner completed");
                        RunnerOutcome::Completed {
                            transcript: vec![
                                TranscriptMessage::user(prompt),
                                TranscriptMessage::assistant(output_text),
                            ],
                        }
                    }
                    ExitKind::Exited(code) => RunnerOutcome::Failed(TaskFailure::new(
                        FailureKind::RunnerError,
                        format!("external CLI exited with code {}", code),
                    )),
                    ExitKind::TimedOut => RunnerOutcome::Failed(TaskFailure::new(
                        FailureKind::TimedOut,
                        "external CLI exceeded the task deadline".to_string(),
                    )),
                    ExitKind::Terminated => {
                        if cancel.is_cancelled() {
                            RunnerOutcome::Cancelled
                        } else {
                            RunnerOutcome::Failed(TaskFailure::new(
                                FailureKind::RunnerError,
                                "external CLI terminated unexpectedly".to_string(),
                            ))
                        }
                    }
                }
            }
        };

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalBroker, ApprovalPolicy};
    use crate::domain::RunnerKind;
    use crate::llm::mock::MockProvider;
    use tempfile::tempdir;

    fn runners(provider: MockProvider, cli: &str, args: Vec<String>) -> Runners {
        let supervisor = Supervisor::with_grace(Duration::from_millis(100));
        Runners {
            provider: Arc::new(provider),
            executor: Arc::new(ToolExecutor::standard(ApprovalBroker::new(
                ApprovalPolicy::default(),
                Duration::from_secs(5),
            ))),
            sessions: SessionRegistry::new(supervisor.clone(), 1024 * 1024),
            supervisor,
            knowledge: None,
            engine_config: EngineConfig {
                streaming: false,
                ..Default::default()
            },
            external_cli: cli.to_string(),
            external_args: args,
        }
    }

    #[tokio::test]
    async fn test_embedded_runner_completes() {
        let temp = tempdir().unwrap();
        let r = runners(MockProvider::new(vec![MockProvider::text_response("done")]), "true", vec![]);
        r.sessions.create_session("t1", RunnerKind::Embedded).await.unwrap();

        let outcome = r
            .run(
                "t1",
                RunnerKind::Embedded,
                "say done",
                temp.path().to_path_buf(),
                None,
                CancelToken::new(),
            )
            .await;

        match outcome {
            RunnerOutcome::Completed { transcript } => {
                assert_eq!(transcript.last().unwrap().text, "done");
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_runner_captures_output() {
        let temp = tempdir().unwrap();
        // "echo" as a stand-in coding CLI; the prompt is its argument
        let r = runners(MockProvider::new(vec![]), "echo", vec![]);
        r.sessions.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        r.sessions.set_running("t1").await.unwrap();

        let outcome = r
            .run(
                "t1",
                RunnerKind::ExternalCli,
                "hello from the cli",
                temp.path().to_path_buf(),
                None,
                CancelToken::new(),
            )
            .await;

        match outcome {
            RunnerOutcome::Completed { transcript } => {
                assert!(transcript.last().unwrap().text.contains("hello from the cli"));
            }
            other => panic!("expected completion, got {:?}", other),
        }

        let info = r.sessions.info("t1").await.unwrap();
        assert!(info.output_bytes > 0);
        assert_eq!(info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_external_runner_nonzero_exit_fails() {
        let temp = tempdir().unwrap();
        let r = runners(MockProvider::new(vec![]), "false", vec![]);
        r.sessions.create_session("t1", RunnerKind::ExternalCli).await.unwrap();

        let outcome = r
            .run(
                "t1",
                RunnerKind::ExternalCli,
                "",
                temp.path().to_path_buf(),
                None,
                CancelToken::new(),
            )
            .await;

        match outcome {
            RunnerOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::RunnerError),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_runner_timeout() {
        let temp = tempdir().unwrap();
        let r = runners(MockProvider::new(vec![]), "sleep", vec![]);
        r.sessions.create_session("t1", RunnerKind::ExternalCli).await.unwrap();

        let outcome = r
            .run(
                "t1",
                RunnerKind::ExternalCli,
                "30",
                temp.path().to_path_buf(),
                Some(Duration::from_millis(100)),
                CancelToken::new(),
            )
            .await;

        match outcome {
            RunnerOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::TimedOut),
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_runner_cancel() {
        let temp = tempdir().unwrap();
        let r = runners(MockProvider::new(vec![]), "sleep", vec![]);
        r.sessions.create_session("t1", RunnerKind::ExternalCli).await.unwrap();

        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel2.cancel();
        });

        let outcome = r
            .run(
                "t1",
                RunnerKind::ExternalCli,
                "30",
                temp.path().to_path_buf(),
                None,
                cancel,
            )
            .await;

        assert!(matches!(outcome, RunnerOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_external_cli_is_spawn_failure() {
        let temp = tempdir().unwrap();
        let r = runners(MockProvider::new(vec![]), "no-such-coding-cli-9000", vec![]);
        r.sessions.create_session("t1", RunnerKind::ExternalCli).await.unwrap();

        let outcome = r
            .run(
                "t1",
                RunnerKind::ExternalCli,
                "",
                temp.path().to_path_buf(),
                None,
                CancelToken::new(),
            )
            .await;

        match outcome {
            RunnerOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::SpawnFailed),
            other => panic!("expected spawn failure, got {:?}", other),
        }
    }
}
