//! AgentKit configuration types and loading

use eyre::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Main AgentKit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Git repository and worktree layout
    pub workspace: WorkspaceConfig,

    /// Task routing and concurrency
    pub router: RouterConfig,

    /// Session output buffering
    pub session: SessionConfig,

    /// Tool approval policy location
    pub approval: ApprovalConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Remote agent protocol surface
    pub rpc: RpcConfig,

    /// Scheduled submissions
    pub schedules: Vec<ScheduleEntry>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .agentkit.yml
        let local_config = PathBuf::from(".agentkit.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/agentkit/agentkit.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentkit").join("agentkit.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Git repository and worktree layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Base git repository tasks fork from
    #[serde(rename = "workspace-root")]
    pub workspace_root: PathBuf,

    /// Directory holding per-task worktrees
    #[serde(rename = "worktree-base")]
    pub worktree_base: PathBuf,

    /// Branch tasks fork from
    #[serde(rename = "base-branch")]
    pub base_branch: String,

    /// Age in seconds after which terminal worktrees become GC-eligible
    #[serde(rename = "gc-idle-age-secs")]
    pub gc_idle_age_secs: u64,

    /// Whether this workspace is primarily a code repository
    ///
    /// Used as the tie-breaker when the router classifies an `auto` prompt.
    #[serde(rename = "code-oriented")]
    pub code_oriented: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            worktree_base: PathBuf::from("/tmp/agentkit/worktrees"),
            base_branch: "main".to_string(),
            gc_idle_age_secs: 24 * 60 * 60,
            code_oriented: true,
        }
    }
}

/// Task routing and concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum tasks running at once; submissions beyond this queue
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: u32,

    /// Default per-task deadline in seconds (0 disables)
    #[serde(rename = "default-task-timeout-secs")]
    pub default_task_timeout_secs: u64,

    /// Executable used for the external coding-CLI runner
    #[serde(rename = "external-cli")]
    pub external_cli: String,

    /// Extra arguments passed to the external CLI before the prompt
    #[serde(rename = "external-cli-args")]
    pub external_cli_args: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            default_task_timeout_secs: 0,
            external_cli: "claude".to_string(),
            external_cli_args: vec!["-p".to_string()],
        }
    }
}

/// Session output buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Replay buffer cap in bytes; oldest chunks drop past this
    #[serde(rename = "output-buffer-limit")]
    pub output_buffer_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_buffer_limit: 4 * 1024 * 1024,
        }
    }
}

/// Tool approval policy location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Policy file (JSON or YAML); empty means built-in defaults
    #[serde(rename = "policy-path")]
    pub policy_path: Option<PathBuf>,

    /// Seconds a pending approval waits before timing out as denied
    #[serde(rename = "decision-timeout-secs")]
    pub decision_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            decision_timeout_secs: 300,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Approximate character budget for assembled prompts
    #[serde(rename = "context-char-budget")]
    pub context_char_budget: usize,

    /// Maximum reason/act turns per task
    #[serde(rename = "max-turns")]
    pub max_turns: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
            context_char_budget: 400_000,
            max_turns: 50,
        }
    }
}

/// Remote agent protocol surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Bind address for the HTTP surface
    pub bind: String,

    /// Path the registry snapshot is periodically written to
    #[serde(rename = "snapshot-path")]
    pub snapshot_path: PathBuf,

    /// Seconds between snapshot writes
    #[serde(rename = "snapshot-interval-secs")]
    pub snapshot_interval_secs: u64,

    /// Expose the git smart-HTTP endpoints for the base repository
    #[serde(rename = "serve-git")]
    pub serve_git: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7431".to_string(),
            snapshot_path: PathBuf::from("/tmp/agentkit/registry.json"),
            snapshot_interval_secs: 30,
            serve_git: false,
        }
    }
}

/// One scheduled submission
///
/// `pattern` uses the natural-language schedule vocabulary ("every hour",
/// "weekdays at 09:00", ...); unknown phrases fail at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub pattern: String,
    pub prompt: String,

    /// embedded, external-cli, or auto
    #[serde(default)]
    pub runner: String,

    /// low, normal, or high
    #[serde(default)]
    pub priority: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.router.max_concurrent_tasks, 8);
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.workspace.base_branch, "main");
        assert!(config.session.output_buffer_limit > 0);
    }

    #[test]
    fn test_load_from_yaml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("agentkit.yml");
        std::fs::write(
            &path,
            "router:\n  max-concurrent-tasks: 3\nworkspace:\n  base-branch: trunk\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.router.max_concurrent_tasks, 3);
        assert_eq!(config.workspace.base_branch, "trunk");
        // Unspecified sections fall back to defaults
        assert_eq!(config.llm.model, LlmConfig::default().model);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/agentkit.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_schedules_section() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("agentkit.yml");
        std::fs::write(
            &path,
            "schedules:\n  - pattern: every morning\n    prompt: triage the inbox\n    priority: low\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].pattern, "every morning");
        assert_eq!(config.schedules[0].priority, "low");
        assert!(config.schedules[0].runner.is_empty());
    }
}
