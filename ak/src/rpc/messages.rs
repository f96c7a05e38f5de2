//! Wire types for the remote agent protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Task, TaskStatus, TranscriptRole};
use crate::tools::CatalogueEntry;

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response envelope
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    // Domain codes sit above -32000
    pub const TASK_NOT_FOUND: i64 = -32001;
    pub const APPROVAL_REQUIRED: i64 = -32002;
    pub const SUBMISSION_REJECTED: i64 = -32003;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A protocol message: role plus ordered parts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

/// One message part
///
/// `text` is the mandatory kind; unknown kinds are carried opaquely so
/// extensions round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

impl RpcMessage {
    /// Concatenated text of all text parts
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Protocol task states
pub type TaskState = &'static str;

/// Map an internal task to its protocol state string
pub fn task_state(status: TaskStatus, awaiting_approval: bool) -> TaskState {
    match status {
        TaskStatus::Pending => "TASK_STATE_SUBMITTED",
        TaskStatus::Running => {
            if awaiting_approval {
                "TASK_STATE_INPUT_REQUIRED"
            } else {
                "TASK_STATE_WORKING"
            }
        }
        TaskStatus::Completed => "TASK_STATE_COMPLETED",
        TaskStatus::Failed => "TASK_STATE_FAILED",
        TaskStatus::Cancelled => "TASK_STATE_CANCELLED",
    }
}

/// Task record returned by the protocol
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub context_id: String,
    pub status: TaskStatusRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<RpcMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusRecord {
    pub state: TaskState,
}

impl TaskRecord {
    /// Build a record from the internal task, with or without history
    pub fn from_task(task: &Task, awaiting_approval: bool, include_history: bool) -> Self {
        let history = if include_history {
            task.transcript
                .iter()
                .map(|m| RpcMessage {
                    role: match m.role {
                        TranscriptRole::User => "user".to_string(),
                        TranscriptRole::Assistant => "assistant".to_string(),
                    },
                    parts: vec![MessagePart::text(m.text.clone())],
                })
                .collect()
        } else {
            Vec::new()
        };

        let error = task.failure.as_ref().map(|f| {
            serde_json::json!({
                "kind": f.kind.to_string(),
                "message": f.message,
            })
        });

        Self {
            id: task.id.clone(),
            context_id: task.id.clone(),
            status: TaskStatusRecord {
                state: task_state(task.status, awaiting_approval),
            },
            history,
            error,
        }
    }
}

/// The agent card served at /.well-known/agent.json
#[derive(Debug, Clone, Serialize)]
pub struct AgentCard {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub skills: Vec<CatalogueEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, Priority, RunnerKind, RunnerSelection, TaskFailure};

    #[test]
    fn test_parse_message_send_params() {
        let params: Value = serde_json::from_str(
            r#"{"message": {"role": "user", "parts": [{"kind": "text", "text": "hello"}]}}"#,
        )
        .unwrap();
        let message: RpcMessage = serde_json::from_value(params["message"].clone()).unwrap();
        assert_eq!(message.role, "user");
        assert_eq!(message.text_content(), "hello");
    }

    #[test]
    fn test_unknown_part_kinds_are_carried() {
        let message: RpcMessage = serde_json::from_str(
            r#"{"role": "user", "parts": [{"kind": "file", "uri": "x://y"}, {"kind": "text", "text": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.parts[0].extra["uri"], "x://y");
        assert_eq!(message.text_content(), "hi");
    }

    #[test]
    fn test_task_state_mapping() {
        assert_eq!(task_state(TaskStatus::Pending, false), "TASK_STATE_SUBMITTED");
        assert_eq!(task_state(TaskStatus::Running, false), "TASK_STATE_WORKING");
        assert_eq!(task_state(TaskStatus::Running, true), "TASK_STATE_INPUT_REQUIRED");
        assert_eq!(task_state(TaskStatus::Completed, false), "TASK_STATE_COMPLETED");
        assert_eq!(task_state(TaskStatus::Failed, false), "TASK_STATE_FAILED");
        assert_eq!(task_state(TaskStatus::Cancelled, false), "TASK_STATE_CANCELLED");
    }

    #[test]
    fn test_task_record_carries_failure_kind() {
        let mut task = Task::new(
            "id-task-x".to_string(),
            "p".to_string(),
            RunnerSelection::Auto,
            RunnerKind::Embedded,
            Priority::Normal,
        );
        task.status = TaskStatus::Failed;
        task.failure = Some(TaskFailure::new(FailureKind::TimedOut, "deadline"));

        let record = TaskRecord::from_task(&task, false, true);
        assert_eq!(record.status.state, "TASK_STATE_FAILED");
        assert_eq!(record.error.as_ref().unwrap()["kind"], "timed-out");
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].role, "user");
    }

    #[test]
    fn test_jsonrpc_response_shapes() {
        let ok = JsonRpcResponse::success(serde_json::json!(1), serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert!(json.get("error").is_none());

        let err = JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, "no such method"),
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }
}
