//! Supervisor implementation: spawn, pump output, enforce deadlines, kill

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::{ControlChar, ExitKind, LaunchSpec, ProcessEvent, ProcessOutcome, SupervisorError};

/// Grace window between SIGTERM and SIGKILL
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Read buffer size for the output pumps
const READ_BUF: usize = 8 * 1024;

/// Live process bookkeeping, keyed by task id
struct ProcessEntry {
    pid: i32,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    /// Set once a cancel/kill was requested so the exit is reported as terminated
    terminate_requested: bool,
}

/// Launches and tracks child processes for running tasks
///
/// One supervisor instance serves the whole runtime; each launch is keyed by
/// its task id so cancellation and stdin injection can find the process.
#[derive(Clone)]
pub struct Supervisor {
    table: Arc<Mutex<HashMap<String, ProcessEntry>>>,
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            grace: DEFAULT_GRACE,
        }
    }

    /// Create a supervisor with a custom grace window (for tests)
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Launch a process and pump its output until it exits
    ///
    /// stdout and stderr are piped and merged into one ordered byte stream,
    /// preserving interleaving as read from the OS. Each chunk is forwarded
    /// to `progress` (when given) and appended to the returned transcript.
    /// A timeout races against process exit; on expiry the process is asked
    /// to terminate and, after the grace window, killed.
    pub async fn launch(
        &self,
        task_id: &str,
        spec: LaunchSpec,
        progress: Option<mpsc::Sender<ProcessEvent>>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        debug!(%task_id, program = %spec.program, "Supervisor::launch: called");

        let program = resolve_executable(&spec.program)?;

        let mut child = Command::new(&program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                program: spec.program.clone(),
                message: e.to_string(),
            })?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        info!(%task_id, pid, program = %program.display(), "Launched process");

        // Stdin writer task fed by a channel so input can arrive mid-run
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = stdin_rx.recv().await {
                    if let Err(e) = stdin.write_all(&data).await {
                        warn!(error = %e, "Supervisor: stdin write failed");
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }
        if let Some(data) = spec.stdin_data.clone() {
            let _ = stdin_tx.send(data).await;
        }

        // Merge both pipes into one channel; chunk order is arrival order
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_pipe(stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_pipe(stderr, chunk_tx));
        }

        {
            let mut table = self.table.lock().await;
            table.insert(
                task_id.to_string(),
                ProcessEntry {
                    pid,
                    stdin_tx: stdin_tx.clone(),
                    terminate_requested: false,
                },
            );
        }

        let mut output: Vec<u8> = Vec::new();
        let mut timed_out = false;

        let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);

        // Drain merged output until both pipes close; the pipes close when
        // the process exits or is killed by the deadline path below.
        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            output.extend_from_slice(&bytes);
                            if let Some(tx) = &progress {
                                let _ = tx.send(ProcessEvent::Output(bytes)).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = deadline_sleep(deadline), if deadline.is_some() && !timed_out => {
                    warn!(%task_id, pid, "Process deadline expired, terminating");
                    timed_out = true;
                    self.terminate_then_kill(pid).await;
                }
            }
        }

        // Reap. A process that closed its pipes but keeps running still has
        // to honour the deadline.
        let exit_status = if timed_out {
            child.wait().await.ok()
        } else {
            match deadline {
                Some(at) => match tokio::time::timeout_at(at, child.wait()).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        warn!(%task_id, pid, "Process deadline expired after pipe close, terminating");
                        timed_out = true;
                        self.terminate_then_kill(pid).await;
                        child.wait().await.ok()
                    }
                },
                None => child.wait().await.ok(),
            }
        };

        let terminate_requested = {
            let mut table = self.table.lock().await;
            table
                .remove(task_id)
                .map(|entry| entry.terminate_requested)
                .unwrap_or(false)
        };

        let code = exit_status.and_then(|s| s.code()).unwrap_or(-1);
        let exit = if timed_out {
            ExitKind::TimedOut
        } else if terminate_requested {
            ExitKind::Terminated
        } else {
            ExitKind::Exited(code)
        };

        debug!(%task_id, ?exit, bytes = output.len(), "Supervisor::launch: finished");
        if let Some(tx) = &progress {
            let _ = tx.send(ProcessEvent::Exited(exit)).await;
        }

        Ok(ProcessOutcome { exit, output })
    }

    /// Cancel a running process: graceful terminate, then kill after grace
    ///
    /// Idempotent; cancelling an unknown or already-exited task is a no-op.
    pub async fn cancel(&self, task_id: &str) {
        debug!(%task_id, "Supervisor::cancel: called");
        let pid = {
            let mut table = self.table.lock().await;
            match table.get_mut(task_id) {
                Some(entry) => {
                    entry.terminate_requested = true;
                    entry.pid
                }
                None => {
                    debug!(%task_id, "Supervisor::cancel: no live process, skipping");
                    return;
                }
            }
        };

        self.terminate_then_kill(pid).await;
    }

    /// Forcefully kill a running process, skipping the grace window
    ///
    /// Idempotent; killing an unknown or already-exited task is a no-op.
    pub async fn kill(&self, task_id: &str) {
        debug!(%task_id, "Supervisor::kill: called");
        let pid = {
            let mut table = self.table.lock().await;
            match table.get_mut(task_id) {
                Some(entry) => {
                    entry.terminate_requested = true;
                    entry.pid
                }
                None => return,
            }
        };
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    /// Write raw bytes to a live process's stdin
    pub async fn send_input(&self, task_id: &str, data: Vec<u8>) -> Result<(), SupervisorError> {
        debug!(%task_id, bytes = data.len(), "Supervisor::send_input: called");
        let tx = {
            let table = self.table.lock().await;
            table
                .get(task_id)
                .map(|entry| entry.stdin_tx.clone())
                .ok_or_else(|| SupervisorError::NotRunning(task_id.to_string()))?
        };
        tx.send(data)
            .await
            .map_err(|_| SupervisorError::NotRunning(task_id.to_string()))
    }

    /// Inject a control character (interrupt, EOF, suspend, clear-screen)
    pub async fn send_control(&self, task_id: &str, control: ControlChar) -> Result<(), SupervisorError> {
        debug!(%task_id, ?control, "Supervisor::send_control: called");
        self.send_input(task_id, vec![control.as_byte()]).await
    }

    /// Whether a process is currently tracked for this task
    pub async fn is_running(&self, task_id: &str) -> bool {
        self.table.lock().await.contains_key(task_id)
    }

    async fn terminate_then_kill(&self, pid: i32) {
        if pid <= 0 {
            return;
        }
        let target = Pid::from_raw(pid);

        if let Err(e) = kill(target, Signal::SIGTERM) {
            // Already gone
            debug!(pid, error = %e, "Supervisor: SIGTERM failed");
            return;
        }

        tokio::time::sleep(self.grace).await;

        // Still alive after the grace window?
        if kill(target, None).is_ok() {
            warn!(pid, "Process survived SIGTERM, sending SIGKILL");
            let _ = kill(target, Signal::SIGKILL);
        }
    }
}

async fn deadline_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Pump one pipe into the merged chunk channel
///
/// A read error does not kill the process; the chunk is dropped and reading
/// continues, giving up only after repeated consecutive failures.
async fn pump_pipe<R>(mut pipe: R, tx: mpsc::Sender<Bytes>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut consecutive_errors = 0u32;

    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                consecutive_errors = 0;
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "Supervisor: pipe read failed, dropping chunk");
                if consecutive_errors >= 3 {
                    break;
                }
            }
        }
    }
}

/// Resolve an executable: direct path probe, then a "which"-style PATH scan
fn resolve_executable(program: &str) -> Result<PathBuf, SupervisorError> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        return Err(SupervisorError::ExecutableNotFound(program.to_string()));
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(SupervisorError::ExecutableNotFound(program.to_string()))
}
