//! External collaborator interfaces and the node adapters that wrap them
//!
//! Collaborators do the domain work (inspecting a source tree, reading a
//! document, asking a judge). Adapters turn them into graph nodes, validate
//! their output at the boundary, and supply the substitute records used when
//! a collaborator fails.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CollaboratorError;
use crate::registry::{Node, NodeContext, NodeKind, NodeOutput};
use crate::state::{
    DocumentRef, EvidenceRecord, JudgeId, Metadata, OpinionRecord, ScoreRange, Slot, StatePatch,
    WorkflowState,
};

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Structural findings about the workspace
#[async_trait]
pub trait SourceTreeCollaborator: Send + Sync {
    async fn investigate(&self, workspace: &Path) -> Result<Vec<EvidenceRecord>, CollaboratorError>;
}

/// Claims matched in the submitted document
#[async_trait]
pub trait DocumentCollaborator: Send + Sync {
    async fn analyse(&self, document: &DocumentRef) -> Result<Vec<EvidenceRecord>, CollaboratorError>;
}

/// Unvalidated judgment as returned by a judgment collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpinion {
    /// Judge identity as reported; must parse to the requested judge
    #[serde(default)]
    pub judge: String,
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub cited_evidence: Vec<String>,
}

/// One judgment per invocation, in the persona of `judge`
#[async_trait]
pub trait JudgmentCollaborator: Send + Sync {
    async fn deliberate(
        &self,
        judge: JudgeId,
        evidence: &[EvidenceRecord],
        metadata: &Metadata,
    ) -> Result<RawOpinion, CollaboratorError>;
}

/// Consumer of the terminal state
pub trait Presenter {
    fn present(&self, state: &WorkflowState) -> anyhow::Result<()>;
}

/// Validate a raw judgment for `expected` against `range`
pub fn validate_opinion(
    raw: RawOpinion,
    expected: JudgeId,
    range: &ScoreRange,
) -> Result<OpinionRecord, CollaboratorError> {
    if raw.judge.trim().is_empty() {
        return Err(CollaboratorError::malformed("judgment carries no judge identity"));
    }
    let reported = JudgeId::from_str(&raw.judge)?;
    if reported != expected {
        return Err(CollaboratorError::malformed(format!(
            "judgment attributed to {}, expected {}",
            reported, expected
        )));
    }
    let record = OpinionRecord::new(expected, raw.score, raw.rationale, range)?
        .with_citations(raw.cited_evidence);
    Ok(record)
}

// ── Detective adapter ────────────────────────────────────────────────────────

/// Collaborator behind a detective node
#[derive(Clone)]
pub enum DetectiveSource {
    SourceTree(Arc<dyn SourceTreeCollaborator>),
    Document(Arc<dyn DocumentCollaborator>),
}

/// Detective node; evidence is keyed under the node id
pub struct DetectiveNode {
    id: String,
    source: DetectiveSource,
}

impl DetectiveNode {
    pub fn source_tree(id: impl Into<String>, collaborator: Arc<dyn SourceTreeCollaborator>) -> Self {
        Self {
            id: id.into(),
            source: DetectiveSource::SourceTree(collaborator),
        }
    }

    pub fn document(id: impl Into<String>, collaborator: Arc<dyn DocumentCollaborator>) -> Self {
        Self {
            id: id.into(),
            source: DetectiveSource::Document(collaborator),
        }
    }

    fn location(&self, state: &WorkflowState) -> String {
        match (&self.source, &state.document) {
            (DetectiveSource::Document(_), DocumentRef::Path(path)) => path.display().to_string(),
            (DetectiveSource::Document(_), DocumentRef::Absent) => "no document".to_string(),
            (DetectiveSource::SourceTree(_), _) => state.workspace.display().to_string(),
        }
    }
}

#[async_trait]
impl Node for DetectiveNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Detective
    }

    fn writes(&self) -> &[Slot] {
        &[Slot::Evidence]
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
        let state = ctx.state();
        let mut records = match &self.source {
            DetectiveSource::SourceTree(c) => c.investigate(&state.workspace).await?,
            DetectiveSource::Document(c) => c.analyse(&state.document).await?,
        };

        if records.is_empty() {
            debug!(node = %self.id, "Collaborator returned no findings");
            records.push(EvidenceRecord::unavailable(
                format!("{} findings", self.id),
                self.location(state),
                "collaborator returned no findings",
            ));
        }

        Ok(NodeOutput::patch(
            StatePatch::new().with_evidence(self.id.clone(), records),
        ))
    }

    fn fallback(&self, ctx: &NodeContext, failure: &CollaboratorError) -> Option<StatePatch> {
        let record = EvidenceRecord::unavailable(
            format!("{} availability", self.id),
            self.location(ctx.state()),
            failure.to_string(),
        );
        Some(StatePatch::new().with_evidence(self.id.clone(), vec![record]))
    }
}

// ── Judge adapter ────────────────────────────────────────────────────────────

/// Judge node; validated opinions only, abstention on failure
pub struct JudgeNode {
    id: String,
    judge: JudgeId,
    collaborator: Arc<dyn JudgmentCollaborator>,
    range: ScoreRange,
}

impl JudgeNode {
    pub fn new(
        id: impl Into<String>,
        judge: JudgeId,
        collaborator: Arc<dyn JudgmentCollaborator>,
        range: ScoreRange,
    ) -> Self {
        Self {
            id: id.into(),
            judge,
            collaborator,
            range,
        }
    }
}

#[async_trait]
impl Node for JudgeNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Judge
    }

    fn writes(&self) -> &[Slot] {
        &[Slot::Opinions]
    }

    fn judge_id(&self) -> Option<JudgeId> {
        Some(self.judge)
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
        let state = ctx.state();
        let mut metadata = state.metadata.clone();
        metadata.insert(
            "evidence_status".to_string(),
            serde_json::to_value(state.evidence_status).unwrap_or_default(),
        );
        metadata.insert(
            "iteration_count".to_string(),
            serde_json::json!(state.iteration_count),
        );

        let raw = self
            .collaborator
            .deliberate(self.judge, &state.aggregated_evidence, &metadata)
            .await?;
        let opinion = validate_opinion(raw, self.judge, &self.range).inspect_err(|e| {
            warn!(node = %self.id, judge = %self.judge, error = %e, "Judgment rejected at boundary");
        })?;

        Ok(NodeOutput::patch(StatePatch::new().with_opinion(opinion)))
    }

    fn fallback(&self, _ctx: &NodeContext, failure: &CollaboratorError) -> Option<StatePatch> {
        let record = OpinionRecord::abstained(self.judge, &self.range, failure.to_string());
        Some(StatePatch::new().with_opinion(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn raw(judge: &str, score: f64) -> RawOpinion {
        RawOpinion {
            judge: judge.to_string(),
            score,
            rationale: "reasoning".into(),
            cited_evidence: vec!["1.1 Graph orchestration".into()],
        }
    }

    #[test]
    fn test_valid_opinion_accepted() {
        let range = ScoreRange::default();
        let record = validate_opinion(raw("Defense", 4.0), JudgeId::Defense, &range).unwrap();
        assert_eq!(record.judge_id(), JudgeId::Defense);
        assert_eq!(record.cited_evidence().len(), 1);
        assert!(!record.is_abstained());
    }

    #[test]
    fn test_out_of_range_is_malformed() {
        let range = ScoreRange::default();
        let err = validate_opinion(raw("defense", 9.0), JudgeId::Defense, &range).unwrap_err();
        assert_eq!(err.kind, FailureKind::Malformed);

        let err = validate_opinion(raw("defense", f64::NAN), JudgeId::Defense, &range).unwrap_err();
        assert_eq!(err.kind, FailureKind::Malformed);
    }

    #[test]
    fn test_wrong_or_missing_judge_is_malformed() {
        let range = ScoreRange::default();
        for judge in ["", "prosecutor", "The Prosecutor", "judge"] {
            let err = validate_opinion(raw(judge, 3.0), JudgeId::TechLead, &range).unwrap_err();
            assert_eq!(err.kind, FailureKind::Malformed, "judge {judge:?}");
        }
    }

    struct Silent;

    #[async_trait]
    impl SourceTreeCollaborator for Silent {
        async fn investigate(&self, _: &Path) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_empty_findings_become_not_found_record() {
        let node = DetectiveNode::source_tree("source_tree", Arc::new(Silent));
        let ctx = NodeContext::new(Arc::new(WorkflowState::new("/ws", DocumentRef::Absent)));
        let output = node.run(ctx).await.unwrap();

        let records: Vec<_> = output.patch.evidence_records().collect();
        assert_eq!(records.len(), 1);
        assert!(!records[0].found());
        assert_eq!(
            output.patch.evidence_agents().collect::<Vec<_>>(),
            ["source_tree"]
        );
    }

    #[test]
    fn test_judge_fallback_is_abstention() {
        struct Never;
        #[async_trait]
        impl JudgmentCollaborator for Never {
            async fn deliberate(
                &self,
                _: JudgeId,
                _: &[EvidenceRecord],
                _: &Metadata,
            ) -> Result<RawOpinion, CollaboratorError> {
                Err(CollaboratorError::unavailable("offline"))
            }
        }

        let node = JudgeNode::new("defense", JudgeId::Defense, Arc::new(Never), ScoreRange::default());
        let ctx = NodeContext::new(Arc::new(WorkflowState::new("/ws", DocumentRef::Absent)));
        let patch = node
            .fallback(&ctx, &CollaboratorError::timeout("slow"))
            .unwrap();
        assert_eq!(patch.opinions().len(), 1);
        assert!(patch.opinions()[0].is_abstained());
        assert_eq!(patch.opinions()[0].score(), 1.0);
    }
}
