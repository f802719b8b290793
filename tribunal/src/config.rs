//! Engine configuration
//!
//! Plain serde struct; every field has a default so partial TOML/JSON files
//! deserialize. Call [`EngineConfig::validate`] before building a workflow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::EvidenceAggregator;
use crate::gate::{QualityGate, DEFAULT_MAX_RETRIES};
use crate::state::{AgentId, JudgeId, ScoreRange};
use crate::synthesizer::{SynthesisConfig, SynthesisError, VerdictLadder};

/// Default per-node timeout in seconds.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 120;
/// Default bound on concurrently executing nodes.
pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 4;
/// Default bound on node executions per run.
pub const DEFAULT_MAX_STEPS: usize = 256;

/// Error type for configuration problems
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Tunables for one engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quality-gate retry ceiling
    pub max_retries: u32,
    pub node_timeout_secs: u64,
    pub max_parallel_workers: usize,
    pub max_steps: usize,
    pub score_range: ScoreRange,
    /// Per-judge weights; absent means an arithmetic mean
    pub judge_weights: Option<BTreeMap<JudgeId, f64>>,
    pub verdict_ladder: VerdictLadder,
    /// Agent priority for evidence tie-breaks, highest first
    pub agent_priority: Vec<AgentId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            node_timeout_secs: DEFAULT_NODE_TIMEOUT_SECS,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            max_steps: DEFAULT_MAX_STEPS,
            score_range: ScoreRange::default(),
            judge_weights: None,
            verdict_ladder: VerdictLadder::default(),
            agent_priority: vec![
                "source_tree".to_string(),
                "history".to_string(),
                "document".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "node_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_parallel_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_parallel_workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid {
                field: "max_steps",
                reason: "must be at least 1".into(),
            });
        }
        if let Some(dup) = first_duplicate(&self.agent_priority) {
            return Err(ConfigError::Invalid {
                field: "agent_priority",
                reason: format!("agent '{}' listed twice", dup),
            });
        }
        self.synthesis_config().validate()?;
        Ok(())
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate::new(self.max_retries)
    }

    pub fn aggregator(&self) -> EvidenceAggregator {
        EvidenceAggregator::new(self.agent_priority.iter().cloned())
    }

    pub fn synthesis_config(&self) -> SynthesisConfig {
        SynthesisConfig {
            weights: self.judge_weights.clone(),
            ladder: self.verdict_ladder.clone(),
            range: self.score_range,
        }
    }
}

fn first_duplicate(items: &[String]) -> Option<&str> {
    items
        .iter()
        .enumerate()
        .find(|(i, item)| items[..*i].contains(item))
        .map(|(_, item)| item.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.agent_priority[0], "source_tree");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_retries": 1, "judge_weights": {"tech_lead": 2.0}}"#)
                .unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.node_timeout_secs, DEFAULT_NODE_TIMEOUT_SECS);
        assert_eq!(
            config.judge_weights.unwrap().get(&JudgeId::TechLead),
            Some(&2.0)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            max_parallel_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "max_parallel_workers",
                ..
            })
        ));

        let config = EngineConfig {
            agent_priority: vec!["a".into(), "b".into(), "a".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            judge_weights: Some(BTreeMap::from([(JudgeId::Defense, f64::NAN)])),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Synthesis(_))));
    }
}
