//! read tool - read file contents

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::approval::RiskLevel;
use crate::tools::{Tool, ToolContext, ToolResult};

/// Maximum bytes returned before truncation
const MAX_OUTPUT: usize = 100_000;

/// Read a file from the worktree
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file. Path is relative to the worktree."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to worktree"
                }
            },
            "required": ["path"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    fn describe(&self, input: &Value) -> String {
        format!("read {}", input["path"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        debug!(?input, "ReadFileTool::execute: called");
        let Some(path) = input["path"].as_str() else {
            return ToolResult::error("path is required");
        };

        let full_path = match ctx.validate_path(Path::new(path)) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => {
                if content.len() > MAX_OUTPUT {
                    let truncated: String = content.chars().take(MAX_OUTPUT).collect();
                    ToolResult::success(format!(
                        "{}...\n[truncated, {} bytes total]",
                        truncated,
                        content.len()
                    ))
                } else {
                    ToolResult::success(content)
                }
            }
            Err(e) => ToolResult::error(format!("Failed to read {}: {}", path, e)),
        }
    }
}
