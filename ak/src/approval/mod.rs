//! Human-in-the-loop approval of risky tool use

mod broker;
mod policy;

pub use broker::{ApprovalBroker, ApprovalEvent, ApprovalOutcome, ApprovalRequest, RequestState};
pub use policy::{ApprovalPolicy, PolicyDecision, PolicyError, RiskLevel};
