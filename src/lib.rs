//! Graphiti Memory - long-term memory for coding-agent sessions
//!
//! A sidecar that sits between an agent host and a knowledge-graph service to:
//! - Retrieve relevant facts and entities before each turn, within a character budget
//! - Detect when injected context has drifted away from the conversation
//! - Persist conversation history and compaction summaries back to the graph
//! - Protect important facts when the host compacts the conversation

pub mod config;
pub mod graph;
pub mod hooks;
pub mod host;
pub mod interceptor;
pub mod memory;
pub mod protocol;
pub mod rules;

pub use graph::{EntityNode, Episode, Fact, GraphClient, NodeRef};
pub use hooks::{HostEvent, MemoryEngine};
pub use host::{HostClient, HostMessage};
pub use interceptor::Interceptor;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Keywords that mark a fact as a decision or constraint
pub const DEFAULT_DECISION_KEYWORDS: &[&str] = &[
    "decided",
    "decision",
    "must",
    "should",
    "prefer",
    "prefers",
    "constraint",
    "require",
    "requires",
    "required",
    "chose",
    "always",
    "never",
    "schema",
    "architecture",
    "agreed",
    "design",
    "selected",
];

/// Budget split ratios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetShares {
    /// Project share when both project and user scopes are present
    pub project_share: f64,

    /// Decision tier share of a compaction section
    pub decision_share: f64,

    /// Active tier share of a compaction section (background takes the rest)
    pub active_share: f64,
}

impl Default for BudgetShares {
    fn default() -> Self {
        Self {
            project_share: 0.7,
            decision_share: 0.4,
            active_share: 0.35,
        }
    }
}

/// Configuration for the memory sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// MCP endpoint of the graph memory service
    pub endpoint: String,

    /// Base URL of the host's session API
    pub host_url: String,

    /// Prefix for project and user group ids
    pub group_id_prefix: String,

    /// Project directory, used to derive the project group id
    pub project_dir: PathBuf,

    /// User identity, used to derive the user group id
    pub user_id: String,

    /// Whether the first injection also searches the user scope
    pub include_user_scope: bool,

    /// Share of the context window spent on per-turn injection
    pub injection_budget_percent: f64,

    /// Share of the context window spent on the compaction digest
    pub compaction_budget_percent: f64,

    /// Characters per token when converting the context window to a budget
    pub chars_per_token: usize,

    /// Jaccard similarity below which injected context counts as drifted
    pub drift_threshold: f64,

    /// Result cap for the drift check search
    pub drift_search_limit: usize,

    /// Age in days at which a fact is marked stale
    pub fact_stale_days: i64,

    /// Minimum buffered bytes before an idle flush is sent
    pub idle_flush_min_bytes: usize,

    /// Hand the injection to the message-transform hook instead of the chat hook
    pub inject_via_transform: bool,

    pub budget: BudgetShares,

    pub decision_keywords: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/mcp".to_string(),
            host_url: "http://localhost:4096".to_string(),
            group_id_prefix: "opencode".to_string(),
            project_dir: PathBuf::from("."),
            user_id: std::env::var("USER").unwrap_or_else(|_| "default".to_string()),
            include_user_scope: true,
            injection_budget_percent: 0.02,
            compaction_budget_percent: 0.03,
            chars_per_token: 4,
            drift_threshold: 0.5,
            drift_search_limit: 10,
            fact_stale_days: 30,
            idle_flush_min_bytes: 50,
            inject_via_transform: false,
            budget: BudgetShares::default(),
            decision_keywords: DEFAULT_DECISION_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

impl MemoryConfig {
    pub fn new(project_dir: PathBuf) -> Self {
        Self {
            project_dir,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_host_url(mut self, host_url: impl Into<String>) -> Self {
        self.host_url = host_url.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_user_scope(mut self, include: bool) -> Self {
        self.include_user_scope = include;
        self
    }

    pub fn with_drift_threshold(mut self, threshold: f64) -> Self {
        self.drift_threshold = threshold;
        self
    }

    pub fn with_inject_via_transform(mut self, deferred: bool) -> Self {
        self.inject_via_transform = deferred;
        self
    }

    /// Group id for project-scoped memory
    pub fn project_group_id(&self) -> String {
        let name = self
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string());
        format!("{}_{}", self.group_id_prefix, sanitize_group_part(&name))
    }

    /// Group id for user-scoped memory
    pub fn user_group_id(&self) -> String {
        format!(
            "{}_user_{}",
            self.group_id_prefix,
            sanitize_group_part(&self.user_id)
        )
    }

    /// Character budget for a share of a context window measured in tokens
    pub fn budget_for(&self, context_limit: usize, percent: f64) -> usize {
        (context_limit as f64 * percent * self.chars_per_token as f64).floor() as usize
    }

    /// Check ratios and percentages are usable
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("injection_budget_percent", self.injection_budget_percent),
            ("compaction_budget_percent", self.compaction_budget_percent),
            ("drift_threshold", self.drift_threshold),
            ("budget.project_share", self.budget.project_share),
            ("budget.decision_share", self.budget.decision_share),
            ("budget.active_share", self.budget.active_share),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.budget.decision_share + self.budget.active_share > 1.0 {
            return Err(MemoryError::Config(
                "budget.decision_share + budget.active_share must not exceed 1".to_string(),
            ));
        }
        if self.fact_stale_days < 0 {
            return Err(MemoryError::Config(
                "fact_stale_days must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn sanitize_group_part(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors that can occur in the memory sidecar
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Graph service error: {0}")]
    Graph(String),

    #[error("Host API error: {0}")]
    Host(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_ids_are_sanitized() {
        let config = MemoryConfig::new(PathBuf::from("/home/dev/my project.rs"))
            .with_user_id("jane@example");
        assert_eq!(config.project_group_id(), "opencode_my_project_rs");
        assert_eq!(config.user_group_id(), "opencode_user_jane_example");
    }

    #[test]
    fn test_budget_for_context_window() {
        let config = MemoryConfig::default();
        assert_eq!(config.budget_for(200_000, 0.02), 16_000);
        assert_eq!(config.budget_for(0, 0.02), 0);
    }

    #[test]
    fn test_validate_rejects_bad_shares() {
        let mut config = MemoryConfig::default();
        assert!(config.validate().is_ok());

        config.budget.decision_share = 0.8;
        config.budget.active_share = 0.5;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::default();
        config.drift_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
