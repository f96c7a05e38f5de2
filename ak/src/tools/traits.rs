//! Tool trait definition

use async_trait::async_trait;
use serde_json::Value;

use super::context::ToolContext;
use crate::approval::RiskLevel;

/// A tool that can be called by the model
///
/// Every tool declares a stable name, a JSON-schema description of its input
/// shape, and a static risk level the approval policy evaluates against.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches the model's tool_use name)
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters (`properties` + `required`)
    fn input_schema(&self) -> Value;

    /// Static risk classification
    fn risk_level(&self) -> RiskLevel;

    /// Whether invocations should be routed through the approval broker
    ///
    /// A hint for the catalogue; the policy makes the actual call.
    fn requires_approval(&self) -> bool {
        self.risk_level() >= RiskLevel::Medium
    }

    /// Render a one-line description of what this invocation would do
    ///
    /// The approval policy matches its patterns against this string.
    fn describe(&self, input: &Value) -> String {
        format!("{} {}", self.name(), input)
    }

    /// Execute the tool
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_success() {
        let result = ToolResult::success("File written successfully");
        assert!(!result.is_error);
        assert_eq!(result.content, "File written successfully");
    }

    #[test]
    fn test_tool_result_error() {
        let result = ToolResult::error("File not found");
        assert!(result.is_error);
        assert_eq!(result.content, "File not found");
    }
}
