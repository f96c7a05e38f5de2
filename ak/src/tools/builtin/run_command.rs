//! bash tool - execute shell commands

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::approval::RiskLevel;
use crate::tools::{Tool, ToolContext, ToolResult};

/// Output cap before truncation
const MAX_OUTPUT: usize = 30_000;

/// Execute a shell command in the worktree
pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command in the worktree. Use for git, build tools, tests."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default: 120000)"
                }
            },
            "required": ["command"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn describe(&self, input: &Value) -> String {
        format!("run {}", input["command"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        debug!(?input, "RunCommandTool::execute: called");
        let Some(command) = input["command"].as_str() else {
            return ToolResult::error("command is required");
        };

        let timeout_ms = input["timeout_ms"].as_u64().unwrap_or(120_000);

        let output = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.worktree)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::error(format!("Failed to execute command: {}", e)),
            Err(_) => return ToolResult::error(format!("Command timed out after {}ms", timeout_ms)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let result = if stdout.is_empty() && !stderr.is_empty() {
            stderr.to_string()
        } else if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}\n\nSTDERR:\n{}", stdout, stderr)
        };

        let truncated = if result.len() > MAX_OUTPUT {
            let head: String = result.chars().take(MAX_OUTPUT).collect();
            format!("{}...\n[truncated, {} chars total]", head, result.len())
        } else {
            result
        };

        if output.status.success() {
            ToolResult::success(truncated)
        } else {
            ToolResult::error(format!(
                "Exit code: {}\n{}",
                output.status.code().unwrap_or(-1),
                truncated
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new(dir.to_path_buf(), "t".to_string(), "s".to_string())
    }

    #[tokio::test]
    async fn test_run_command_basic() {
        let temp = tempdir().unwrap();
        let result = RunCommandTool
            .execute(serde_json::json!({"command": "echo hello"}), &ctx(temp.path()))
            .await;

        assert!(!result.is_error);
        assert!(result.content.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        let temp = tempdir().unwrap();
        let result = RunCommandTool
            .execute(serde_json::json!({"command": "false"}), &ctx(temp.path()))
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("Exit code: 1"));
    }

    #[tokio::test]
    async fn test_run_command_stderr_captured() {
        let temp = tempdir().unwrap();
        let result = RunCommandTool
            .execute(serde_json::json!({"command": "echo oops >&2"}), &ctx(temp.path()))
            .await;

        assert!(!result.is_error);
        assert!(result.content.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let temp = tempdir().unwrap();
        let result = RunCommandTool
            .execute(
                serde_json::json!({"command": "sleep 5", "timeout_ms": 50}),
                &ctx(temp.path()),
            )
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }

    #[test]
    fn test_bash_is_high_risk() {
        assert_eq!(RunCommandTool.risk_level(), RiskLevel::High);
        assert!(RunCommandTool.requires_approval());
    }

    #[test]
    fn test_describe_shows_command() {
        let desc = RunCommandTool.describe(&serde_json::json!({"command": "rm -rf /tmp/x"}));
        assert_eq!(desc, "run rm -rf /tmp/x");
    }
}
