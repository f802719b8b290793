//! Audit configuration: TOML file, then environment, then CLI flags

use std::path::Path;

use serde::{Deserialize, Serialize};
use tribunal::{ConfigError, EngineConfig};

pub const ENV_MAX_RETRIES: &str = "AUDIT_MAX_RETRIES";
pub const ENV_NODE_TIMEOUT_SECS: &str = "AUDIT_NODE_TIMEOUT_SECS";
pub const ENV_MAX_PARALLEL: &str = "AUDIT_MAX_PARALLEL";
pub const ENV_JUDGE_URL: &str = "AUDIT_JUDGE_URL";
pub const ENV_JUDGE_MODEL: &str = "AUDIT_JUDGE_MODEL";
pub const ENV_JUDGE_API_KEY: &str = "AUDIT_JUDGE_API_KEY";

const DEFAULT_JUDGE_URL: &str = "http://localhost:8080/v1";
const DEFAULT_JUDGE_MODEL: &str = "local-model";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;

/// Which judgment collaborator backs the judge nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JudgeBackend {
    /// Deterministic rubric scoring, no network
    #[default]
    Offline,
    /// OpenAI-compatible chat completions
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub backend: JudgeBackend,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            backend: JudgeBackend::Offline,
            url: DEFAULT_JUDGE_URL.to_string(),
            model: DEFAULT_JUDGE_MODEL.to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 1024,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Top-level audit configuration.
///
/// ```toml
/// [engine]
/// max_retries = 2
/// agent_priority = ["source_tree", "history", "document"]
///
/// [judge]
/// backend = "http"
/// url = "http://localhost:8080/v1"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub engine: EngineConfig,
    pub judge: JudgeConfig,
}

impl AuditConfig {
    /// File (if any), then process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;
        Self::from_toml_str(&raw, &origin)
    }

    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply `AUDIT_*` overrides from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.engine.max_retries = parse_env(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_NODE_TIMEOUT_SECS) {
            self.engine.node_timeout_secs = parse_env(ENV_NODE_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PARALLEL) {
            self.engine.max_parallel_workers = parse_env(ENV_MAX_PARALLEL, &v)?;
        }
        if let Some(v) = lookup(ENV_JUDGE_URL) {
            self.judge.url = v;
        }
        if let Some(v) = lookup(ENV_JUDGE_MODEL) {
            self.judge.model = v;
        }
        if let Some(v) = lookup(ENV_JUDGE_API_KEY) {
            self.judge.api_key = Some(v).filter(|k| !k.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.judge.backend == JudgeBackend::Http && self.judge.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "judge.url",
                reason: "required for the http backend".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.judge.temperature) {
            return Err(ConfigError::Invalid {
                field: "judge.temperature",
                reason: format!("{} is outside 0.0..=2.0", self.judge.temperature),
            });
        }
        if self.judge.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "judge.request_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_env<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| ConfigError::Invalid {
        field: key,
        reason: format!("'{}': {}", value, e),
    })
}
