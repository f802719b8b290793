//! Audit rubric: what each detective looks for
//!
//! Loaded from JSON; the built-in rubric covers multi-agent orchestration
//! projects. Patterns are compiled once, when a detective is constructed.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Version tag of the built-in rubric
pub const BUILTIN_RUBRIC_VERSION: &str = "builtin-1";

#[derive(Debug, thiserror::Error)]
pub enum RubricError {
    #[error("Failed to read rubric {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse rubric {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Rubric entry has an empty goal")]
    EmptyGoal,

    #[error("Invalid pattern for '{goal}': {source}")]
    Pattern { goal: String, source: regex::Error },

    #[error("Claim '{0}' lists no keywords")]
    NoKeywords(String),

    #[error("Claim '{0}' has a blank keyword")]
    BlankKeyword(String),

    #[error("Goal '{0}' appears more than once")]
    DuplicateGoal(String),
}

/// Regex searched for across the source tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCheck {
    pub goal: String,
    pub pattern: String,
    /// File extensions to search, without the dot; empty searches all files
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl SourceCheck {
    pub fn new(goal: &str, pattern: &str, extensions: &[&str]) -> Self {
        Self {
            goal: goal.to_string(),
            pattern: pattern.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn applies_to(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
    }

    pub fn compile(&self) -> Result<Regex, RubricError> {
        Regex::new(&self.pattern).map_err(|source| RubricError::Pattern {
            goal: self.goal.clone(),
            source,
        })
    }
}

/// Claim expected in the submitted report; any keyword counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentClaim {
    pub goal: String,
    pub keywords: Vec<String>,
}

impl DocumentClaim {
    pub fn new(goal: &str, keywords: &[&str]) -> Self {
        Self {
            goal: goal.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Case-insensitive alternation of the escaped keywords; blank keywords are skipped
    pub fn compile(&self) -> Result<Regex, RubricError> {
        let alternation = self
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");
        RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .map_err(|source| RubricError::Pattern {
                goal: self.goal.clone(),
                source,
            })
    }
}

/// Commit-history expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequirement {
    pub goal: String,
    pub min_commits: usize,
}

impl Default for HistoryRequirement {
    fn default() -> Self {
        Self {
            goal: "3.1 Atomic commit history".to_string(),
            min_commits: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub version: String,
    #[serde(default)]
    pub source_checks: Vec<SourceCheck>,
    #[serde(default)]
    pub document_claims: Vec<DocumentClaim>,
    #[serde(default)]
    pub history: HistoryRequirement,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            version: BUILTIN_RUBRIC_VERSION.to_string(),
            source_checks: vec![
                SourceCheck::new(
                    "1.1 Graph orchestration",
                    r"StateGraph|add_conditional_edges|GraphBuilder|add_edge\s*\(",
                    &[],
                ),
                SourceCheck::new(
                    "1.2 Typed state",
                    r"BaseModel|TypedDict|#\[derive\([^)]*Deserialize",
                    &["py", "rs", "ts"],
                ),
                SourceCheck::new(
                    "1.3 Parallel fan-out",
                    r"asyncio\.gather|Send\(|JoinSet|join_all|fan_out",
                    &["py", "rs", "ts"],
                ),
                SourceCheck::new(
                    "1.4 Sandboxed tooling",
                    r"tempfile|TemporaryDirectory|mkdtemp|sandbox",
                    &["py", "rs", "ts"],
                ),
            ],
            document_claims: vec![
                DocumentClaim::new("2.1 Fan-In / Fan-Out", &["fan-in", "fan-out", "fan in", "fan out"]),
                DocumentClaim::new("2.2 Dialectical Synthesis", &["dialectical", "synthesis"]),
                DocumentClaim::new("2.3 Metacognition", &["metacognition"]),
            ],
            history: HistoryRequirement::default(),
        }
    }
}

impl Rubric {
    /// Load and validate a rubric file
    pub fn load(path: &Path) -> Result<Self, RubricError> {
        let origin = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| RubricError::Io {
            path: origin.clone(),
            source,
        })?;
        Self::from_json(&raw, &origin)
    }

    pub fn from_json(raw: &str, origin: &str) -> Result<Self, RubricError> {
        let rubric: Rubric = serde_json::from_str(raw).map_err(|source| RubricError::Parse {
            path: origin.to_string(),
            source,
        })?;
        rubric.validate()?;
        Ok(rubric)
    }

    /// Load `path` if given, else the built-in rubric
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, RubricError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), RubricError> {
        let mut seen = std::collections::HashSet::new();
        let goals = self
            .source_checks
            .iter()
            .map(|c| &c.goal)
            .chain(self.document_claims.iter().map(|c| &c.goal))
            .chain(std::iter::once(&self.history.goal));
        for goal in goals {
            if goal.trim().is_empty() {
                return Err(RubricError::EmptyGoal);
            }
            if !seen.insert(goal.as_str()) {
                return Err(RubricError::DuplicateGoal(goal.clone()));
            }
        }

        for check in &self.source_checks {
            check.compile()?;
        }
        for claim in &self.document_claims {
            if claim.keywords.is_empty() {
                return Err(RubricError::NoKeywords(claim.goal.clone()));
            }
            if claim.keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(RubricError::BlankKeyword(claim.goal.clone()));
            }
            claim.compile()?;
        }
        Ok(())
    }
}
