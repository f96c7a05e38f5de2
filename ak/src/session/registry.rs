//! SessionRegistry - multiplexes task output to subscribers
//!
//! Each session keeps a bounded append-only log of output chunks plus a
//! broadcast channel for live events. A new subscriber snapshots the log and
//! joins the broadcast under the same lock, so the replay prefix and the
//! live tail line up with no gaps and no duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::{SessionError, SessionEvent, SessionInfo, SessionStatus};
use crate::domain::RunnerKind;
use crate::process::Supervisor;

/// Capacity of each session's live broadcast channel
const BROADCAST_CAPACITY: usize = 1024;

/// An event paired with its position in the session's total order
#[derive(Debug, Clone)]
struct SeqEvent {
    seq: u64,
    event: SessionEvent,
}

struct SessionInner {
    runner: RunnerKind,
    status: SessionStatus,
    exit_code: Option<i32>,
    /// Retained output chunks for the replay prefix
    chunks: VecDeque<Bytes>,
    /// Bytes currently retained in `chunks`
    retained_bytes: usize,
    /// Whether chunks were dropped to honour the buffer limit
    truncated: bool,
    /// Total bytes ever appended
    total_bytes: u64,
    /// Next sequence number to assign
    next_seq: u64,
    live: broadcast::Sender<SeqEvent>,
}

impl SessionInner {
    fn publish(&mut self, event: SessionEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        // No subscribers is fine; the buffer still records history
        let _ = self.live.send(SeqEvent { seq, event });
    }
}

/// Holds live sessions and fans their output out to subscribers
///
/// Sessions are keyed by task id; a session is one-to-one with its task
/// while running. Cloneable; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<SessionInner>>>>>,
    supervisor: Supervisor,
    buffer_limit: usize,
}

impl SessionRegistry {
    pub fn new(supervisor: Supervisor, buffer_limit: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            supervisor,
            buffer_limit,
        }
    }

    /// Register a session for a task
    pub async fn create_session(&self, task_id: &str, runner: RunnerKind) -> Result<(), SessionError> {
        debug!(%task_id, %runner, "SessionRegistry::create_session: called");
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        let inner = SessionInner {
            runner,
            status: SessionStatus::Pending,
            exit_code: None,
            chunks: VecDeque::new(),
            retained_bytes: 0,
            truncated: false,
            total_bytes: 0,
            next_seq: 0,
            live,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.insert(task_id.to_string(), Arc::new(Mutex::new(inner)));
        info!(%task_id, "Session created");
        Ok(())
    }

    /// Mark a session running
    pub async fn set_running(&self, task_id: &str) -> Result<(), SessionError> {
        let session = self.get(task_id).await?;
        let mut inner = session.lock().await;
        if !inner.status.is_terminal() {
            inner.status = SessionStatus::Running;
        }
        Ok(())
    }

    /// Append a chunk of combined output and fan it out
    pub async fn append_output(&self, task_id: &str, data: Bytes) -> Result<(), SessionError> {
        let session = self.get(task_id).await?;
        let mut inner = session.lock().await;

        inner.total_bytes += data.len() as u64;
        inner.retained_bytes += data.len();
        inner.chunks.push_back(data.clone());

        // Overflow drops the oldest replay chunks; live subscribers are
        // unaffected because the event still goes out below.
        while inner.retained_bytes > self.buffer_limit && inner.chunks.len() > 1 {
            if let Some(dropped) = inner.chunks.pop_front() {
                inner.retained_bytes -= dropped.len();
                inner.truncated = true;
            }
        }

        inner.publish(SessionEvent::Output { data });
        Ok(())
    }

    /// Record a process exit code (precedes the terminal event)
    pub async fn mark_exited(&self, task_id: &str, code: i32) -> Result<(), SessionError> {
        let session = self.get(task_id).await?;
        let mut inner = session.lock().await;
        inner.exit_code = Some(code);
        inner.publish(SessionEvent::Exit { code });
        Ok(())
    }

    /// Drive a session to a terminal state and notify all subscribers
    ///
    /// Idempotent: a second terminal transition is ignored.
    pub async fn mark_terminal(&self, task_id: &str, status: SessionStatus) -> Result<(), SessionError> {
        debug!(%task_id, ?status, "SessionRegistry::mark_terminal: called");
        let session = self.get(task_id).await?;
        let mut inner = session.lock().await;

        if inner.status.is_terminal() {
            debug!(%task_id, "SessionRegistry::mark_terminal: already terminal, ignoring");
            return Ok(());
        }

        inner.status = status;
        inner.publish(SessionEvent::Terminated { status });
        info!(%task_id, ?status, "Session terminal");
        Ok(())
    }

    /// Subscribe to a session's output
    ///
    /// The subscription yields the buffered prefix as one `Replay` event,
    /// then the live tail in order, ending with the terminal event.
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, SessionError> {
        let session = self.get(task_id).await?;
        let inner = session.lock().await;

        let mut staged = VecDeque::new();

        // Snapshot the retained prefix
        if !inner.chunks.is_empty() || inner.truncated {
            let mut data = BytesMut::with_capacity(inner.retained_bytes);
            for chunk in &inner.chunks {
                data.extend_from_slice(chunk);
            }
            staged.push_back(SessionEvent::Replay {
                data: data.freeze(),
                truncated: inner.truncated,
            });
        }

        // A late joiner on a terminal session replays history and closes
        if inner.status.is_terminal() {
            if let Some(code) = inner.exit_code {
                staged.push_back(SessionEvent::Exit { code });
            }
            staged.push_back(SessionEvent::Terminated { status: inner.status });
            return Ok(Subscription {
                staged,
                live: None,
                next_seq: inner.next_seq,
            });
        }

        // Joining the broadcast under the session lock lines the live tail
        // up exactly after the snapshot
        let live = inner.live.subscribe();
        Ok(Subscription {
            staged,
            live: Some(live),
            next_seq: inner.next_seq,
        })
    }

    /// Write bytes to the session's stdin (interactive sessions only)
    pub async fn send_input(&self, task_id: &str, data: Vec<u8>) -> Result<(), SessionError> {
        let session = self.get(task_id).await?;
        {
            let inner = session.lock().await;
            if inner.status != SessionStatus::Running || inner.runner != RunnerKind::ExternalCli {
                return Err(SessionError::NotRunning(task_id.to_string()));
            }
        }
        self.supervisor
            .send_input(task_id, data)
            .await
            .map_err(|_| SessionError::NotRunning(task_id.to_string()))
    }

    /// Graceful shutdown of a session's process. Idempotent.
    pub async fn terminate(&self, task_id: &str) -> Result<(), SessionError> {
        debug!(%task_id, "SessionRegistry::terminate: called");
        let _ = self.get(task_id).await?;
        self.supervisor.cancel(task_id).await;
        Ok(())
    }

    /// Forceful shutdown of a session's process. Idempotent.
    pub async fn kill(&self, task_id: &str) -> Result<(), SessionError> {
        debug!(%task_id, "SessionRegistry::kill: called");
        let _ = self.get(task_id).await?;
        self.supervisor.kill(task_id).await;
        Ok(())
    }

    /// Snapshot of a session's state
    pub async fn info(&self, task_id: &str) -> Result<SessionInfo, SessionError> {
        let session = self.get(task_id).await?;
        let inner = session.lock().await;
        Ok(SessionInfo {
            status: inner.status,
            output_bytes: inner.total_bytes,
            exit_code: inner.exit_code,
        })
    }

    /// Ids of sessions that are not yet terminal
    pub async fn live_sessions(&self) -> Vec<String> {
        // Snapshot the map first; never hold the registry lock across the
        // per-session locks.
        let entries: Vec<(String, Arc<Mutex<SessionInner>>)> = {
            let sessions = self.sessions.lock().await;
            sessions.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        let mut live = Vec::new();
        for (id, session) in entries {
            if !session.lock().await.status.is_terminal() {
                live.push(id);
            }
        }
        live.sort();
        live
    }

    async fn get(&self, task_id: &str) -> Result<Arc<Mutex<SessionInner>>, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(task_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(task_id.to_string()))
    }
}

/// An ordered view of one session's output
///
/// `recv` yields events until the terminal event has been delivered, then
/// returns `None`.
pub struct Subscription {
    staged: VecDeque<SessionEvent>,
    live: Option<broadcast::Receiver<SeqEvent>>,
    next_seq: u64,
}

impl Subscription {
    /// Receive the next event in the session's total order
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.staged.pop_front() {
            if matches!(event, SessionEvent::Terminated { .. }) {
                self.live = None;
                self.staged.clear();
            }
            return Some(event);
        }

        let rx = self.live.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(seq_event) => {
                    // The replay snapshot already covered earlier sequences
                    if seq_event.seq < self.next_seq {
                        continue;
                    }
                    self.next_seq = seq_event.seq + 1;
                    if matches!(seq_event.event, SessionEvent::Terminated { .. }) {
                        self.live = None;
                    }
                    return Some(seq_event.event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Data loss is surfaced explicitly, never silently
                    warn!(skipped, "Session subscriber lagged; emitting truncation marker");
                    return Some(SessionEvent::Replay {
                        data: Bytes::new(),
                        truncated: true,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.live = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Supervisor::new(), 1024 * 1024)
    }

    fn registry_with_limit(limit: usize) -> SessionRegistry {
        SessionRegistry::new(Supervisor::new(), limit)
    }

    async fn collect_until_terminal(sub: &mut Subscription) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            let terminal = matches!(event, SessionEvent::Terminated { .. });
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_prefix_then_live() {
        let reg = registry();
        reg.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        reg.set_running("t1").await.unwrap();

        reg.append_output("t1", Bytes::from_static(b"A")).await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"B")).await.unwrap();

        // Subscribe after A and B are buffered, before C arrives
        let mut sub = reg.subscribe("t1").await.unwrap();

        reg.append_output("t1", Bytes::from_static(b"C")).await.unwrap();
        reg.mark_terminal("t1", SessionStatus::Completed).await.unwrap();

        let events = collect_until_terminal(&mut sub).await;

        match &events[0] {
            SessionEvent::Replay { data, truncated } => {
                assert_eq!(data.as_ref(), b"AB");
                assert!(!truncated);
            }
            other => panic!("expected replay first, got {:?}", other),
        }
        match &events[1] {
            SessionEvent::Output { data } => assert_eq!(data.as_ref(), b"C"),
            other => panic!("expected live C, got {:?}", other),
        }
        assert!(matches!(events[2], SessionEvent::Terminated { status: SessionStatus::Completed }));
        assert_eq!(events.len(), 3);

        // Stream is closed after the terminal event
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_two_subscribers_see_same_order() {
        let reg = registry();
        reg.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        reg.set_running("t1").await.unwrap();

        let mut early = reg.subscribe("t1").await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"one")).await.unwrap();

        let mut late = reg.subscribe("t1").await.unwrap();

        reg.append_output("t1", Bytes::from_static(b"two")).await.unwrap();
        reg.mark_terminal("t1", SessionStatus::Completed).await.unwrap();

        let early_events = collect_until_terminal(&mut early).await;
        let late_events = collect_until_terminal(&mut late).await;

        // Early subscriber: two live chunks then terminal
        let early_bytes: Vec<u8> = early_events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { data } => Some(data.to_vec()),
                SessionEvent::Replay { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        // Late subscriber: replay of "one" then live "two"
        let late_bytes: Vec<u8> = late_events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { data } => Some(data.to_vec()),
                SessionEvent::Replay { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();

        assert_eq!(early_bytes, b"onetwo");
        assert_eq!(late_bytes, b"onetwo");
    }

    #[tokio::test]
    async fn test_subscriber_after_terminal_gets_full_history_and_close() {
        let reg = registry();
        reg.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        reg.set_running("t1").await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"done output")).await.unwrap();
        reg.mark_exited("t1", 0).await.unwrap();
        reg.mark_terminal("t1", SessionStatus::Completed).await.unwrap();

        let mut sub = reg.subscribe("t1").await.unwrap();
        let events = collect_until_terminal(&mut sub).await;

        assert!(matches!(&events[0], SessionEvent::Replay { data, .. } if data.as_ref() == b"done output"));
        assert!(matches!(events[1], SessionEvent::Exit { code: 0 }));
        assert!(matches!(events[2], SessionEvent::Terminated { .. }));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_buffer_overflow_truncates_replay_only() {
        let reg = registry_with_limit(8);
        reg.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        reg.set_running("t1").await.unwrap();

        // Live subscriber sees everything despite the tiny buffer
        let mut live_sub = reg.subscribe("t1").await.unwrap();

        reg.append_output("t1", Bytes::from_static(b"AAAA")).await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"BBBB")).await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"CCCC")).await.unwrap();

        // Late subscriber gets a truncated replay
        let mut late_sub = reg.subscribe("t1").await.unwrap();

        reg.mark_terminal("t1", SessionStatus::Completed).await.unwrap();

        let live_events = collect_until_terminal(&mut live_sub).await;
        let live_bytes: Vec<u8> = live_events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { data } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(live_bytes, b"AAAABBBBCCCC");

        let late_events = collect_until_terminal(&mut late_sub).await;
        match &late_events[0] {
            SessionEvent::Replay { data, truncated } => {
                assert!(truncated);
                // Oldest chunks dropped; the tail is retained
                assert!(data.len() <= 8);
                assert!(data.ends_with(b"CCCC"));
            }
            other => panic!("expected truncated replay, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_transition_is_idempotent() {
        let reg = registry();
        reg.create_session("t1", RunnerKind::Embedded).await.unwrap();
        reg.set_running("t1").await.unwrap();

        reg.mark_terminal("t1", SessionStatus::Failed).await.unwrap();
        reg.mark_terminal("t1", SessionStatus::Completed).await.unwrap();

        let info = reg.info("t1").await.unwrap();
        assert_eq!(info.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_input_requires_running_external_session() {
        let reg = registry();
        reg.create_session("t1", RunnerKind::Embedded).await.unwrap();
        reg.set_running("t1").await.unwrap();

        let result = reg.send_input("t1", b"hi".to_vec()).await;
        assert!(matches!(result, Err(SessionError::NotRunning(_))));

        let result = reg.send_input("ghost", b"hi".to_vec()).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_info_counts_cumulative_bytes() {
        let reg = registry_with_limit(4);
        reg.create_session("t1", RunnerKind::ExternalCli).await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"12345678")).await.unwrap();
        reg.append_output("t1", Bytes::from_static(b"abcd")).await.unwrap();

        // Cumulative count is unaffected by replay truncation
        let info = reg.info("t1").await.unwrap();
        assert_eq!(info.output_bytes, 12);
    }
}
