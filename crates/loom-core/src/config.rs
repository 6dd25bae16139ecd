//! Engine configuration (spec §6).
//!
//! Every field has the default from the specification's configuration
//! table. Values are typically loaded from a `loom.toml` file in the
//! target repository and overridden by environment variables, following
//! the same env-override convention as [`loom_store::CoordinationConfig`].

use serde::{Deserialize, Serialize};

/// Which agent type/model to use for a given role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRoleConfig {
    pub agent_type: String,
    pub model: String,
}

impl Default for AgentRoleConfig {
    fn default() -> Self {
        Self {
            agent_type: "claude-code".to_string(),
            model: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentsConfig {
    pub worker: AgentRoleConfig,
    pub judge: AgentRoleConfig,
    pub planner: AgentRoleConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            worker: AgentRoleConfig::default(),
            judge: AgentRoleConfig::default(),
            planner: AgentRoleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitConfig {
    pub auto_signature: bool,
    pub integration_signature: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            auto_signature: false,
            integration_signature: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationMethod {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategyConfig {
    FfPrefer,
    NoFf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationConfig {
    pub method: IntegrationMethod,
    pub post_integration_evaluation: bool,
    pub max_additional_task_iterations: u32,
    pub merge_strategy: MergeStrategyConfig,
    /// Glob patterns auto-resolved "ours" on conflict (lockfiles, generated
    /// and vendored files). Configuration, not hard-coded, per spec §4.7.
    pub auto_resolve_ours_globs: Vec<String>,
    /// Glob patterns treated as binary (abort entire merge on conflict).
    pub binary_globs: Vec<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Auto,
            post_integration_evaluation: true,
            max_additional_task_iterations: 3,
            merge_strategy: MergeStrategyConfig::FfPrefer,
            auto_resolve_ours_globs: vec![
                "*.lock".to_string(),
                "Cargo.lock".to_string(),
                "package-lock.json".to_string(),
                "yarn.lock".to_string(),
                "pnpm-lock.yaml".to_string(),
                "go.sum".to_string(),
                "*.generated.*".to_string(),
                "vendor/**".to_string(),
                "node_modules/**".to_string(),
            ],
            binary_globs: vec![
                "*.png".to_string(),
                "*.jpg".to_string(),
                "*.jpeg".to_string(),
                "*.gif".to_string(),
                "*.ico".to_string(),
                "*.pdf".to_string(),
                "*.zip".to_string(),
                "*.woff".to_string(),
                "*.woff2".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanningConfig {
    pub quality_threshold: u32,
    pub strict_context_validation: bool,
    pub max_task_duration: u32,
    pub max_tasks: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 60,
            strict_context_validation: false,
            max_task_duration: 4,
            max_tasks: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationsConfig {
    pub planner_quality_retries: u32,
    pub judge_task_retries: u32,
    pub orchestrate_main_loop: u32,
    pub serial_chain_task_retries: u32,
}

impl Default for IterationsConfig {
    fn default() -> Self {
        Self {
            planner_quality_retries: 5,
            judge_task_retries: 3,
            orchestrate_main_loop: 3,
            serial_chain_task_retries: 3,
        }
    }
}

/// Top-level engine configuration, per spec §6's configuration option list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_workers: u32,
    pub agents: AgentsConfig,
    pub commit: CommitConfig,
    pub integration: IntegrationConfig,
    pub planning: PlanningConfig,
    pub iterations: IterationsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            agents: AgentsConfig::default(),
            commit: CommitConfig::default(),
            integration: IntegrationConfig::default(),
            planning: PlanningConfig::default(),
            iterations: IterationsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from a `loom.toml` document.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.integration.max_additional_task_iterations, 3);
        assert_eq!(cfg.planning.quality_threshold, 60);
        assert_eq!(cfg.planning.max_tasks, 5);
        assert_eq!(cfg.iterations.judge_task_retries, 3);
        assert!(!cfg.commit.auto_signature);
        assert!(cfg.commit.integration_signature);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = EngineConfig::default();
        let s = cfg.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&s).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = EngineConfig::from_toml_str("max_workers = 8\n").unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.planning.max_tasks, 5);
    }
}
