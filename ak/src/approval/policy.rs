//! Declarative approval policy
//!
//! Evaluation is pure: the only mutable state in the approval subsystem is
//! the per-tool trust counter, which lives in the broker.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Static risk classification a tool declares at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Error types for policy loading
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read policy file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse policy file: {0}")]
    Parse(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// On-disk policy shape (JSON or YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PolicyFile {
    /// Action descriptions matching any of these always need a human
    #[serde(rename = "always-require")]
    always_require: Vec<String>,

    /// Action descriptions matching any of these auto-approve
    #[serde(rename = "auto-approve")]
    auto_approve: Vec<String>,

    /// Tools that never need approval (unless always-require matches)
    #[serde(rename = "allow-tools")]
    allow_tools: Vec<String>,

    /// Tools that are always denied
    #[serde(rename = "deny-tools")]
    deny_tools: Vec<String>,

    /// Highest risk level that may auto-approve
    #[serde(rename = "max-auto-risk")]
    max_auto_risk: RiskLevel,

    /// Auto-approve a tool after this many human approvals (0 disables)
    #[serde(rename = "trust-threshold")]
    trust_threshold: u32,
}

/// Result of a pure policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    AutoApprove,
    RequireApproval,
    Deny,
}

/// Compiled approval policy
#[derive(Debug)]
pub struct ApprovalPolicy {
    always_require: Vec<Regex>,
    auto_approve: Vec<Regex>,
    allow_tools: Vec<String>,
    deny_tools: Vec<String>,
    max_auto_risk: RiskLevel,
    trust_threshold: u32,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        // Built-in default: low-risk tools run, everything else asks
        Self {
            always_require: Vec::new(),
            auto_approve: Vec::new(),
            allow_tools: Vec::new(),
            deny_tools: Vec::new(),
            max_auto_risk: RiskLevel::Low,
            trust_threshold: 0,
        }
    }
}

impl ApprovalPolicy {
    /// Load a policy from a JSON or YAML file
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;

        let file: PolicyFile = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|e| PolicyError::Parse(e.to_string()))?
        } else {
            serde_yaml::from_str(&content).map_err(|e| PolicyError::Parse(e.to_string()))?
        };

        Self::compile(file)
    }

    fn compile(file: PolicyFile) -> Result<Self, PolicyError> {
        let compile_patterns = |patterns: Vec<String>| -> Result<Vec<Regex>, PolicyError> {
            patterns
                .into_iter()
                .map(|p| {
                    Regex::new(&p).map_err(|e| PolicyError::InvalidPattern {
                        pattern: p.clone(),
                        message: e.to_string(),
                    })
                })
                .collect()
        };

        Ok(Self {
            always_require: compile_patterns(file.always_require)?,
            auto_approve: compile_patterns(file.auto_approve)?,
            allow_tools: file.allow_tools,
            deny_tools: file.deny_tools,
            max_auto_risk: file.max_auto_risk,
            trust_threshold: file.trust_threshold,
        })
    }

    /// Evaluate one tool invocation
    ///
    /// `action` is the rendered human-readable description of what the tool
    /// is about to do; `trust` is the tool's current approval count.
    pub fn evaluate(&self, tool: &str, risk: RiskLevel, action: &str, trust: u32) -> PolicyDecision {
        if self.deny_tools.iter().any(|t| t == tool) {
            return PolicyDecision::Deny;
        }

        // always-require patterns block every auto path, trust included
        if self.always_require.iter().any(|re| re.is_match(action)) {
            return PolicyDecision::RequireApproval;
        }

        if self.allow_tools.iter().any(|t| t == tool) {
            return PolicyDecision::AutoApprove;
        }

        if self.trust_threshold > 0 && trust >= self.trust_threshold {
            return PolicyDecision::AutoApprove;
        }

        if self.auto_approve.iter().any(|re| re.is_match(action)) {
            return PolicyDecision::AutoApprove;
        }

        if risk <= self.max_auto_risk {
            return PolicyDecision::AutoApprove;
        }

        PolicyDecision::RequireApproval
    }

    /// The configured trust threshold (0 when disabled)
    pub fn trust_threshold(&self) -> u32 {
        self.trust_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(file: PolicyFile) -> ApprovalPolicy {
        ApprovalPolicy::compile(file).unwrap()
    }

    #[test]
    fn test_default_policy_approves_low_risk_only() {
        let p = ApprovalPolicy::default();
        assert_eq!(p.evaluate("read", RiskLevel::Low, "read a.txt", 0), PolicyDecision::AutoApprove);
        assert_eq!(
            p.evaluate("write", RiskLevel::Medium, "write a.txt", 0),
            PolicyDecision::RequireApproval
        );
        assert_eq!(
            p.evaluate("bash", RiskLevel::High, "run rm -rf /", 0),
            PolicyDecision::RequireApproval
        );
    }

    #[test]
    fn test_deny_list_wins() {
        let p = policy(PolicyFile {
            deny_tools: vec!["bash".to_string()],
            allow_tools: vec!["bash".to_string()],
            ..Default::default()
        });
        assert_eq!(p.evaluate("bash", RiskLevel::Low, "run ls", 0), PolicyDecision::Deny);
    }

    #[test]
    fn test_always_require_blocks_allow_list() {
        let p = policy(PolicyFile {
            allow_tools: vec!["bash".to_string()],
            always_require: vec!["rm -rf".to_string()],
            ..Default::default()
        });

        assert_eq!(p.evaluate("bash", RiskLevel::Low, "run ls", 0), PolicyDecision::AutoApprove);
        assert_eq!(
            p.evaluate("bash", RiskLevel::Low, "run rm -rf /tmp/x", 0),
            PolicyDecision::RequireApproval
        );
    }

    #[test]
    fn test_always_require_blocks_trust() {
        let p = policy(PolicyFile {
            trust_threshold: 3,
            always_require: vec!["delete".to_string()],
            ..Default::default()
        });

        assert_eq!(
            p.evaluate("write", RiskLevel::High, "delete everything", 99),
            PolicyDecision::RequireApproval
        );
    }

    #[test]
    fn test_trust_threshold_promotes_tool() {
        let p = policy(PolicyFile {
            trust_threshold: 3,
            ..Default::default()
        });

        assert_eq!(
            p.evaluate("write", RiskLevel::High, "write file", 2),
            PolicyDecision::RequireApproval
        );
        assert_eq!(
            p.evaluate("write", RiskLevel::High, "write file", 3),
            PolicyDecision::AutoApprove
        );
    }

    #[test]
    fn test_auto_approve_patterns() {
        let p = policy(PolicyFile {
            auto_approve: vec!["^read ".to_string()],
            max_auto_risk: RiskLevel::Low,
            ..Default::default()
        });

        assert_eq!(
            p.evaluate("custom", RiskLevel::High, "read /tmp/file", 0),
            PolicyDecision::AutoApprove
        );
    }

    #[test]
    fn test_risk_ceiling() {
        let p = policy(PolicyFile {
            max_auto_risk: RiskLevel::Medium,
            ..Default::default()
        });

        assert_eq!(
            p.evaluate("write", RiskLevel::Medium, "write file", 0),
            PolicyDecision::AutoApprove
        );
        assert_eq!(
            p.evaluate("bash", RiskLevel::High, "run command", 0),
            PolicyDecision::RequireApproval
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = ApprovalPolicy::compile(PolicyFile {
            always_require: vec!["[unclosed".to_string()],
            ..Default::default()
        });
        assert!(matches!(result, Err(PolicyError::InvalidPattern { .. })));
    }

    #[test]
    fn test_load_yaml_policy() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("policy.yml");
        std::fs::write(
            &path,
            "max-auto-risk: medium\nallow-tools:\n  - read\ntrust-threshold: 5\n",
        )
        .unwrap();

        let p = ApprovalPolicy::load(&path).unwrap();
        assert_eq!(p.trust_threshold(), 5);
        assert_eq!(p.evaluate("read", RiskLevel::Critical, "read x", 0), PolicyDecision::AutoApprove);
        assert_eq!(p.evaluate("other", RiskLevel::Medium, "do x", 0), PolicyDecision::AutoApprove);
    }

    #[test]
    fn test_load_json_policy() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("policy.json");
        std::fs::write(&path, r#"{"deny-tools": ["bash"], "max-auto-risk": "high"}"#).unwrap();

        let p = ApprovalPolicy::load(&path).unwrap();
        assert_eq!(p.evaluate("bash", RiskLevel::Low, "run", 0), PolicyDecision::Deny);
        assert_eq!(p.evaluate("write", RiskLevel::High, "write", 0), PolicyDecision::AutoApprove);
    }
}
