//! Core record types for audit workflow state
//!
//! Evidence and opinions are the only two units of data that flow between
//! nodes. Both are validated on construction and never mutated afterwards;
//! everything downstream operates on the typed form only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of the detective that produced a batch of evidence
pub type AgentId = String;

/// Evidence keyed by producing agent, each list in production order
pub type EvidenceStore = BTreeMap<AgentId, Vec<EvidenceRecord>>;

/// Free-form run metadata
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Error raised when a record fails validation at construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("Evidence goal must not be empty")]
    EmptyGoal,

    #[error("Score {score} is outside the range [{min}, {max}]")]
    ScoreOutOfRange { score: f64, min: f64, max: f64 },

    #[error("Score is not a finite number")]
    NonFiniteScore,

    #[error("Unknown judge identity: {0:?}")]
    UnknownJudge(String),

    #[error("Invalid score range: min {min} must be below max {max}")]
    InvalidRange { min: f64, max: f64 },
}

/// Judge identity for a judgment node
///
/// Closed set: anything a collaborator reports outside it is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeId {
    /// Adversarial reading: assumes shortcuts until evidence proves otherwise
    Prosecutor,
    /// Charitable reading: rewards intent and partial progress
    Defense,
    /// Pragmatic reading: weighs whether the result actually works
    TechLead,
}

impl JudgeId {
    /// All judge identities, in canonical order
    pub fn all() -> &'static [JudgeId] {
        &[JudgeId::Prosecutor, JudgeId::Defense, JudgeId::TechLead]
    }

    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeId::Prosecutor => "prosecutor",
            JudgeId::Defense => "defense",
            JudgeId::TechLead => "tech_lead",
        }
    }
}

impl std::fmt::Display for JudgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgeId {
    type Err = RecordError;

    /// Exact match against the canonical names, ignoring case and the
    /// `_`/`-`/space separators (`TechLead`, `tech_lead`, `Tech Lead`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "prosecutor" => Ok(JudgeId::Prosecutor),
            "defense" => Ok(JudgeId::Defense),
            "techlead" => Ok(JudgeId::TechLead),
            _ => Err(RecordError::UnknownJudge(s.to_string())),
        }
    }
}

/// Closed interval of admissible judge scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl ScoreRange {
    pub fn new(min: f64, max: f64) -> Result<Self, RecordError> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min >= self.max {
            return Err(RecordError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }

    /// Map a ratio in [0, 1] onto the range
    pub fn scale(&self, ratio: f64) -> f64 {
        let ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.min + ratio * (self.max - self.min)
    }
}

impl Default for ScoreRange {
    fn default() -> Self {
        Self { min: 1.0, max: 5.0 }
    }
}

/// A single fact produced by a detective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EvidenceDraft")]
pub struct EvidenceRecord {
    goal: String,
    found: bool,
    rationale: String,
    confidence: f64,
    location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// Unvalidated wire form of [`EvidenceRecord`]
#[derive(Debug, Deserialize)]
struct EvidenceDraft {
    goal: String,
    found: bool,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    location: String,
    #[serde(default)]
    content: Option<String>,
}

impl TryFrom<EvidenceDraft> for EvidenceRecord {
    type Error = RecordError;

    fn try_from(draft: EvidenceDraft) -> Result<Self, Self::Error> {
        let mut record = EvidenceRecord::new(draft.goal, draft.found, draft.location)?
            .with_rationale(draft.rationale)
            .with_confidence(draft.confidence);
        if let Some(content) = draft.content {
            record = record.with_content(content);
        }
        Ok(record)
    }
}

impl EvidenceRecord {
    /// Create a new evidence record
    ///
    /// Confidence defaults to a neutral 0.5 until set.
    pub fn new(
        goal: impl Into<String>,
        found: bool,
        location: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let goal = goal.into();
        if goal.trim().is_empty() {
            return Err(RecordError::EmptyGoal);
        }
        Ok(Self {
            goal,
            found,
            rationale: String::new(),
            confidence: 0.5,
            location: location.into(),
            content: None,
        })
    }

    /// A `found=false` record standing in for a collaborator that could not
    /// deliver. Always valid: an empty goal falls back to the location.
    pub fn unavailable(
        goal: impl Into<String>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let location = location.into();
        let mut goal = goal.into();
        if goal.trim().is_empty() {
            goal = format!("{} availability", location);
        }
        if goal.trim().is_empty() {
            goal = "collaborator availability".to_string();
        }
        Self {
            goal,
            found: false,
            rationale: reason.into(),
            confidence: 1.0,
            location,
            content: None,
        }
    }

    /// Set the rationale
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Set confidence, clamped to [0, 1]; NaN becomes 0
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// Attach the raw snippet backing the finding
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

/// A judge's scored opinion on the aggregated evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OpinionDraft")]
pub struct OpinionRecord {
    judge_id: JudgeId,
    score: f64,
    rationale: String,
    cited_evidence: Vec<String>,
    abstained: bool,
}

#[derive(Debug, Deserialize)]
struct OpinionDraft {
    judge_id: JudgeId,
    score: f64,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    cited_evidence: Vec<String>,
    #[serde(default)]
    abstained: bool,
}

impl TryFrom<OpinionDraft> for OpinionRecord {
    type Error = RecordError;

    fn try_from(draft: OpinionDraft) -> Result<Self, Self::Error> {
        if !draft.score.is_finite() {
            return Err(RecordError::NonFiniteScore);
        }
        Ok(Self {
            judge_id: draft.judge_id,
            score: draft.score,
            rationale: draft.rationale,
            cited_evidence: draft.cited_evidence,
            abstained: draft.abstained,
        })
    }
}

impl OpinionRecord {
    /// Create an opinion, rejecting scores that are non-finite or outside `range`
    pub fn new(
        judge_id: JudgeId,
        score: f64,
        rationale: impl Into<String>,
        range: &ScoreRange,
    ) -> Result<Self, RecordError> {
        if !score.is_finite() {
            return Err(RecordError::NonFiniteScore);
        }
        if !range.contains(score) {
            return Err(RecordError::ScoreOutOfRange {
                score,
                min: range.min,
                max: range.max,
            });
        }
        Ok(Self {
            judge_id,
            score,
            rationale: rationale.into(),
            cited_evidence: Vec::new(),
            abstained: false,
        })
    }

    /// Minimum-score record substituted for a judge that failed to deliver
    pub fn abstained(judge_id: JudgeId, range: &ScoreRange, reason: impl Into<String>) -> Self {
        Self {
            judge_id,
            score: range.min,
            rationale: format!("abstained: {}", reason.into()),
            cited_evidence: Vec::new(),
            abstained: true,
        }
    }

    /// Set cited evidence goals; blank entries are dropped
    pub fn with_citations(mut self, goals: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cited_evidence = goals
            .into_iter()
            .map(Into::into)
            .filter(|g: &String| !g.trim().is_empty())
            .collect();
        self
    }

    pub fn judge_id(&self) -> JudgeId {
        self.judge_id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn cited_evidence(&self) -> &[String] {
        &self.cited_evidence
    }

    pub fn is_abstained(&self) -> bool {
        self.abstained
    }
}

/// Reference to the submitted report document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum DocumentRef {
    /// No document submitted
    #[default]
    Absent,
    /// Path to the document on disk
    Path(PathBuf),
}

impl DocumentRef {
    pub fn from_option(path: Option<PathBuf>) -> Self {
        path.map(DocumentRef::Path).unwrap_or(DocumentRef::Absent)
    }
}

/// Final verdict tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Elite,
    Approved,
    Probation,
    Rejected,
    /// No opinions were available to judge on
    #[default]
    Void,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Elite => write!(f, "elite"),
            Self::Approved => write!(f, "approved"),
            Self::Probation => write!(f, "probation"),
            Self::Rejected => write!(f, "rejected"),
            Self::Void => write!(f, "void"),
        }
    }
}

/// Quality gate's assessment of the aggregated evidence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    /// Gate has not evaluated yet
    #[default]
    Pending,
    Sufficient,
    /// Retry ceiling reached without any positive finding
    Insufficient,
}

/// Kind of non-fatal condition recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    CollaboratorUnavailable,
    CollaboratorTimeout,
    MalformedJudgment,
    RetryCeilingExceeded,
}

impl std::fmt::Display for FlagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CollaboratorUnavailable => write!(f, "collaborator_unavailable"),
            Self::CollaboratorTimeout => write!(f, "collaborator_timeout"),
            Self::MalformedJudgment => write!(f, "malformed_judgment"),
            Self::RetryCeilingExceeded => write!(f, "retry_ceiling_exceeded"),
        }
    }
}

/// A flagged, non-fatal condition surfaced in the final report
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunFlag {
    pub kind: FlagKind,
    pub node: String,
    pub iteration: u32,
    pub detail: String,
}

impl RunFlag {
    pub fn new(
        kind: FlagKind,
        node: impl Into<String>,
        iteration: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            node: node.into(),
            iteration,
            detail: detail.into(),
        }
    }
}

/// The whole state of one audit run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Root of the repository under audit
    pub workspace: PathBuf,
    /// Submitted report document
    pub document: DocumentRef,
    /// Raw evidence per detective, append-only across retries
    pub evidence: EvidenceStore,
    /// Deduplicated, goal-ordered evidence from the latest aggregation
    pub aggregated_evidence: Vec<EvidenceRecord>,
    pub evidence_status: EvidenceStatus,
    /// At most one opinion per judge, ordered by judge identity
    pub opinions: Vec<OpinionRecord>,
    pub aggregated_score: f64,
    pub verdict: Verdict,
    /// Synthesized explanation of the score and verdict
    pub rationale: String,
    /// Non-fatal conditions, in canonical order
    pub flags: Vec<RunFlag>,
    pub metadata: Metadata,
    /// Number of quality-gate retries taken so far
    pub iteration_count: u32,
}

impl WorkflowState {
    /// Fresh state with empty containers and a new run id
    pub fn new(workspace: impl Into<PathBuf>, document: DocumentRef) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(
            "run_id".to_string(),
            serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
        );
        metadata.insert(
            "started_at".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );

        Self {
            workspace: workspace.into(),
            document,
            evidence: EvidenceStore::new(),
            aggregated_evidence: Vec::new(),
            evidence_status: EvidenceStatus::Pending,
            opinions: Vec::new(),
            aggregated_score: 0.0,
            verdict: Verdict::Void,
            rationale: String::new(),
            flags: Vec::new(),
            metadata,
            iteration_count: 0,
        }
    }

    /// Seed a metadata entry before the run starts
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        self.metadata.get("run_id").and_then(|v| v.as_str())
    }

    /// Whether the gate had to proceed without positive evidence
    pub fn evidence_insufficient(&self) -> bool {
        self.evidence_status == EvidenceStatus::Insufficient
    }

    /// Total evidence records across all agents and iterations
    pub fn evidence_count(&self) -> usize {
        self.evidence.values().map(Vec::len).sum()
    }
}
