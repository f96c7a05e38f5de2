//! Approval broker: suspends risky tool use pending a decision
//!
//! The broker owns the pending-request table and the per-tool trust
//! counters. Consumers that want to render pending requests subscribe to the
//! event stream or take a snapshot copy; nobody else holds the broker's
//! lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use super::policy::{ApprovalPolicy, PolicyDecision, RiskLevel};
use crate::domain::short_request_id;

/// A decision pending for one risky tool invocation
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub tool: String,
    /// Rendered human-readable description of the action
    pub action: String,
    pub risk: RiskLevel,
    pub requested_at: DateTime<Utc>,
}

/// Terminal state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Approved,
    Denied,
    TimedOut,
}

/// What the executor gets back for one invocation
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Proceed; the human may have edited the arguments
    Approved { modified_arguments: Option<serde_json::Value> },
    Denied,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved { .. })
    }
}

/// Lifecycle events published for UI consumption
#[derive(Debug, Clone)]
pub enum ApprovalEvent {
    Requested(ApprovalRequest),
    Resolved { request_id: String, state: RequestState },
}

struct PendingEntry {
    request: ApprovalRequest,
    decision_tx: oneshot::Sender<ApprovalOutcome>,
}

struct BrokerInner {
    pending: HashMap<String, PendingEntry>,
    trust: HashMap<String, u32>,
}

/// Brokers approval decisions for risky tool invocations
///
/// Cloneable; all clones share the pending table and trust counters. The
/// policy is an immutable snapshot taken at construction - tasks started
/// under one policy keep it for their lifetime.
#[derive(Clone)]
pub struct ApprovalBroker {
    policy: Arc<ApprovalPolicy>,
    inner: Arc<Mutex<BrokerInner>>,
    events: broadcast::Sender<ApprovalEvent>,
    default_timeout: Duration,
}

impl ApprovalBroker {
    pub fn new(policy: ApprovalPolicy, default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            policy: Arc::new(policy),
            inner: Arc::new(Mutex::new(BrokerInner {
                pending: HashMap::new(),
                trust: HashMap::new(),
            })),
            events,
            default_timeout,
        }
    }

    /// Decide whether a tool invocation may proceed
    ///
    /// Auto-approvals return immediately. Anything the policy judges risky
    /// registers a pending request and suspends until `resolve` is called or
    /// the timeout elapses (timeout counts as deny). Exactly one terminal
    /// outcome is produced per invocation.
    pub async fn check(
        &self,
        task_id: &str,
        tool: &str,
        risk: RiskLevel,
        action: &str,
        timeout: Option<Duration>,
    ) -> ApprovalOutcome {
        debug!(%task_id, %tool, %risk, "ApprovalBroker::check: called");

        let trust = {
            let inner = self.inner.lock().await;
            inner.trust.get(tool).copied().unwrap_or(0)
        };

        match self.policy.evaluate(tool, risk, action, trust) {
            PolicyDecision::AutoApprove => {
                debug!(%task_id, %tool, "ApprovalBroker::check: auto-approved");
                ApprovalOutcome::Approved { modified_arguments: None }
            }
            PolicyDecision::Deny => {
                info!(%task_id, %tool, "Tool denied by policy");
                ApprovalOutcome::Denied
            }
            PolicyDecision::RequireApproval => self.suspend(task_id, tool, risk, action, timeout).await,
        }
    }

    async fn suspend(
        &self,
        task_id: &str,
        tool: &str,
        risk: RiskLevel,
        action: &str,
        timeout: Option<Duration>,
    ) -> ApprovalOutcome {
        let request = ApprovalRequest {
            id: short_request_id(),
            task_id: task_id.to_string(),
            tool: tool.to_string(),
            action: action.to_string(),
            risk,
            requested_at: Utc::now(),
        };
        let request_id = request.id.clone();

        let (decision_tx, decision_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(
                request_id.clone(),
                PendingEntry {
                    request: request.clone(),
                    decision_tx,
                },
            );
        }

        info!(%task_id, %tool, request_id = %request_id, "Approval required, suspending tool execution");
        let _ = self.events.send(ApprovalEvent::Requested(request));

        let wait = timeout.unwrap_or(self.default_timeout);
        let outcome = match tokio::time::timeout(wait, decision_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Resolver dropped without a decision (broker shutdown)
            Ok(Err(_)) => ApprovalOutcome::Denied,
            Err(_) => {
                warn!(request_id = %request_id, "Approval request timed out");
                // Remove the dangling entry so a late resolve is a no-op
                let mut inner = self.inner.lock().await;
                inner.pending.remove(&request_id);
                let _ = self.events.send(ApprovalEvent::Resolved {
                    request_id: request_id.clone(),
                    state: RequestState::TimedOut,
                });
                ApprovalOutcome::TimedOut
            }
        };

        // Trust counts successful human approvals only
        if outcome.is_approved() {
            let mut inner = self.inner.lock().await;
            let counter = inner.trust.entry(tool.to_string()).or_insert(0);
            *counter += 1;
            debug!(%tool, trust = *counter, "ApprovalBroker: trust incremented");
        }

        outcome
    }

    /// Resolve a pending request
    ///
    /// Returns `true` if this call took effect. A second resolve of the same
    /// request (or a resolve after timeout) is a no-op returning `false`.
    pub async fn resolve(&self, request_id: &str, approved: bool, modified_arguments: Option<serde_json::Value>) -> bool {
        debug!(%request_id, approved, "ApprovalBroker::resolve: called");

        let entry = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(request_id)
        };

        let Some(entry) = entry else {
            debug!(%request_id, "ApprovalBroker::resolve: unknown or already resolved, ignoring");
            return false;
        };

        let state = if approved { RequestState::Approved } else { RequestState::Denied };
        let outcome = if approved {
            ApprovalOutcome::Approved { modified_arguments }
        } else {
            ApprovalOutcome::Denied
        };

        let delivered = entry.decision_tx.send(outcome).is_ok();
        let _ = self.events.send(ApprovalEvent::Resolved {
            request_id: request_id.to_string(),
            state,
        });
        info!(%request_id, ?state, "Approval request resolved");
        delivered
    }

    /// Deny every pending request belonging to a task (cancel propagation)
    pub async fn deny_all_for_task(&self, task_id: &str) {
        debug!(%task_id, "ApprovalBroker::deny_all_for_task: called");
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .values()
                .filter(|e| e.request.task_id == task_id)
                .map(|e| e.request.id.clone())
                .collect()
        };
        for id in ids {
            self.resolve(&id, false, None).await;
        }
    }

    /// Copy of the pending requests, oldest first
    pub async fn pending_snapshot(&self) -> Vec<ApprovalRequest> {
        let inner = self.inner.lock().await;
        let mut requests: Vec<ApprovalRequest> = inner.pending.values().map(|e| e.request.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Pending request ids for a task (used to derive input-required state)
    pub async fn pending_for_task(&self, task_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<(&ApprovalRequest, String)> = inner
            .pending
            .values()
            .filter(|e| e.request.task_id == task_id)
            .map(|e| (&e.request, e.request.id.clone()))
            .collect();
        entries.sort_by_key(|(r, _)| r.requested_at);
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Subscribe to approval lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    /// Current trust counter for a tool
    pub async fn trust_count(&self, tool: &str) -> u32 {
        let inner = self.inner.lock().await;
        inner.trust.get(tool).copied().unwrap_or(0)
    }

    /// Clear the trust counter for one tool, or all tools
    pub async fn reset_trust(&self, tool: Option<&str>) {
        let mut inner = self.inner.lock().await;
        match tool {
            Some(tool) => {
                inner.trust.remove(tool);
                info!(%tool, "Trust counter reset");
            }
            None => {
                inner.trust.clear();
                info!("All trust counters reset");
            }
        }
    }
}
