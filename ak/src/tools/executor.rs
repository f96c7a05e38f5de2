//! ToolExecutor - validates, approves, and runs tool invocations

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::approval::{ApprovalBroker, ApprovalOutcome, RiskLevel};
use crate::llm::{ToolCall, ToolDefinition};

use super::builtin::{ListDirectoryTool, ReadFileTool, RunCommandTool, WriteFileTool};
use super::schema::validate_input;
use super::{Tool, ToolContext, ToolResult};

/// Catalogue entry emitted in the agent card
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogueEntry {
    pub name: String,
    pub description: String,
    #[serde(rename = "input-schema")]
    pub input_schema: Value,
    #[serde(rename = "risk-level")]
    pub risk_level: RiskLevel,
    #[serde(rename = "requires-approval")]
    pub requires_approval: bool,
}

/// Runs tool invocations for tasks
///
/// Pipeline per invocation: lookup, schema validation, approval decision,
/// execution. Every invocation reaches exactly one terminal disposition;
/// handler panics are captured and returned as errors.
pub struct ToolExecutor {
    tools: HashMap<String, Box<dyn Tool>>,
    broker: ApprovalBroker,
}

impl ToolExecutor {
    /// Create an executor with the standard tool set
    pub fn standard(broker: ApprovalBroker) -> Self {
        let mut executor = Self::empty(broker);
        executor.register(Box::new(ReadFileTool));
        executor.register(Box::new(WriteFileTool));
        executor.register(Box::new(ListDirectoryTool));
        executor.register(Box::new(RunCommandTool));
        executor
    }

    /// Create an executor with no tools registered
    pub fn empty(broker: ApprovalBroker) -> Self {
        Self {
            tools: HashMap::new(),
            broker,
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        debug!(name = tool.name(), "ToolExecutor::register: called");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Tool definitions for the provider request
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Full catalogue including risk metadata, for the agent card
    pub fn catalogue(&self) -> Vec<CatalogueEntry> {
        let mut entries: Vec<CatalogueEntry> = self
            .tools
            .values()
            .map(|t| CatalogueEntry {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                risk_level: t.risk_level(),
                requires_approval: t.requires_approval(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Execute a single tool call
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        debug!(tool = %call.name, task_id = %ctx.task_id, "ToolExecutor::execute: called");

        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::error(format!("unknown-tool: {}", call.name));
        };

        if let Err(message) = validate_input(&tool.input_schema(), &call.input) {
            return ToolResult::error(format!("invalid-arguments: {}", message));
        }

        // Approval decision happens, and is recorded, before execution begins
        let action = tool.describe(&call.input);
        let mut input = call.input.clone();
        match self
            .broker
            .check(&ctx.task_id, &call.name, tool.risk_level(), &action, None)
            .await
        {
            ApprovalOutcome::Approved { modified_arguments } => {
                if let Some(modified) = modified_arguments {
                    debug!(tool = %call.name, "ToolExecutor::execute: arguments modified by approver");
                    input = modified;
                }
            }
            ApprovalOutcome::Denied => {
                return ToolResult::error(format!("approval denied: {}", action));
            }
            ApprovalOutcome::TimedOut => {
                return ToolResult::error(format!("approval timed out: {}", action));
            }
        }

        // Handler panics become error results, never process aborts
        match AssertUnwindSafe(tool.execute(input, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool handler panicked".to_string());
                warn!(tool = %call.name, %message, "Tool handler panicked");
                ToolResult::error(format!("tool panicked: {}", message))
            }
        }
    }

    /// Execute tool calls strictly in order, one at a time
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<(String, ToolResult)> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute(call, ctx).await;
            results.push((call.id.clone(), result));
        }
        results
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}
