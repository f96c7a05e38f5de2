//! write tool - write content to a file

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::approval::RiskLevel;
use crate::tools::{Tool, ToolContext, ToolResult};

/// Write content to a file, creating parent directories as needed
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn description(&self) -> &'static str {
        "Write content to a file. Creates parent directories if needed."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to worktree"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn describe(&self, input: &Value) -> String {
        format!("write {}", input["path"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        debug!(?input, "WriteFileTool::execute: called");
        let Some(path) = input["path"].as_str() else {
            return ToolResult::error("path is required");
        };
        let Some(content) = input["content"].as_str() else {
            return ToolResult::error("content is required");
        };

        let full_path = match ctx.validate_path(Path::new(path)) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        if let Some(parent) = full_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return ToolResult::error(format!("Failed to create directories: {}", e));
        }

        if let Err(e) = tokio::fs::write(&full_path, content).await {
            return ToolResult::error(format!("Failed to write file: {}", e));
        }

        debug!(bytes = content.len(), "WriteFileTool::execute: file written");
        ToolResult::success(format!("Wrote {} bytes to {}", content.len(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir.to_path_buf(), "t".to_string(), "s".to_string())
    }

    #[tokio::test]
    async fn test_write_file_basic() {
        let temp = tempdir().unwrap();

        let result = WriteFileTool
            .execute(
                serde_json::json!({"path": "test.txt", "content": "Hello, world!"}),
                &ctx(temp.path()),
            )
            .await;

        assert!(!result.is_error);
        assert!(result.content.contains("13 bytes"));
        assert_eq!(fs::read_to_string(temp.path().join("test.txt")).unwrap(), "Hello, world!");
    }

    #[tokio::test]
    async fn test_write_file_creates_directories() {
        let temp = tempdir().unwrap();

        let result = WriteFileTool
            .execute(
                serde_json::json!({"path": "nested/dir/test.txt", "content": "content"}),
                &ctx(temp.path()),
            )
            .await;

        assert!(!result.is_error);
        assert_eq!(
            fs::read_to_string(temp.path().join("nested/dir/test.txt")).unwrap(),
            "content"
        );
    }

    #[tokio::test]
    async fn test_write_file_missing_content() {
        let temp = tempdir().unwrap();

        let result = WriteFileTool
            .execute(serde_json::json!({"path": "test.txt"}), &ctx(temp.path()))
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("content is required"));
    }

    #[test]
    fn test_write_is_medium_risk() {
        assert_eq!(WriteFileTool.risk_level(), RiskLevel::Medium);
        assert!(WriteFileTool.requires_approval());
    }
}
