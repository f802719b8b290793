//! State patches proposed by nodes
//!
//! A node never mutates state. It returns a [`StatePatch`] naming the slots it
//! wants to write; the scheduler merges it through the schema's reducers.

use std::path::PathBuf;

use super::reducers::Slot;
use super::types::*;

/// Partial update to [`WorkflowState`], one optional value per slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub(crate) workspace: Option<PathBuf>,
    pub(crate) document: Option<DocumentRef>,
    pub(crate) evidence: Option<EvidenceStore>,
    pub(crate) aggregated_evidence: Option<Vec<EvidenceRecord>>,
    pub(crate) evidence_status: Option<EvidenceStatus>,
    pub(crate) opinions: Option<Vec<OpinionRecord>>,
    pub(crate) aggregated_score: Option<f64>,
    pub(crate) verdict: Option<Verdict>,
    pub(crate) rationale: Option<String>,
    pub(crate) flags: Option<Vec<RunFlag>>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) iteration_count: Option<u32>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_document(mut self, document: DocumentRef) -> Self {
        self.document = Some(document);
        self
    }

    /// Add evidence produced by `agent`
    pub fn with_evidence(
        mut self,
        agent: impl Into<AgentId>,
        records: impl IntoIterator<Item = EvidenceRecord>,
    ) -> Self {
        self.evidence
            .get_or_insert_with(EvidenceStore::new)
            .entry(agent.into())
            .or_default()
            .extend(records);
        self
    }

    pub fn with_aggregated_evidence(mut self, records: Vec<EvidenceRecord>) -> Self {
        self.aggregated_evidence = Some(records);
        self
    }

    pub fn with_evidence_status(mut self, status: EvidenceStatus) -> Self {
        self.evidence_status = Some(status);
        self
    }

    pub fn with_opinion(mut self, opinion: OpinionRecord) -> Self {
        self.opinions.get_or_insert_with(Vec::new).push(opinion);
        self
    }

    pub fn with_aggregated_score(mut self, score: f64) -> Self {
        self.aggregated_score = Some(score);
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_flag(mut self, flag: RunFlag) -> Self {
        self.flags.get_or_insert_with(Vec::new).push(flag);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_iteration_count(mut self, iteration: u32) -> Self {
        self.iteration_count = Some(iteration);
        self
    }

    /// Slots this patch writes, in slot order
    pub fn written_slots(&self) -> Vec<Slot> {
        let present = [
            (Slot::Workspace, self.workspace.is_some()),
            (Slot::Document, self.document.is_some()),
            (Slot::Evidence, self.evidence.is_some()),
            (Slot::AggregatedEvidence, self.aggregated_evidence.is_some()),
            (Slot::EvidenceStatus, self.evidence_status.is_some()),
            (Slot::Opinions, self.opinions.is_some()),
            (Slot::AggregatedScore, self.aggregated_score.is_some()),
            (Slot::Verdict, self.verdict.is_some()),
            (Slot::Rationale, self.rationale.is_some()),
            (Slot::Flags, self.flags.is_some()),
            (Slot::Metadata, self.metadata.is_some()),
            (Slot::IterationCount, self.iteration_count.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(slot, written)| written.then_some(slot))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.written_slots().is_empty()
    }

    /// Agent keys of the evidence this patch carries
    pub fn evidence_agents(&self) -> impl Iterator<Item = &str> {
        self.evidence
            .iter()
            .flat_map(|store| store.keys().map(String::as_str))
    }

    /// Evidence records carried by this patch, across all agents
    pub fn evidence_records(&self) -> impl Iterator<Item = &EvidenceRecord> {
        self.evidence.iter().flat_map(|store| store.values().flatten())
    }

    pub fn opinions(&self) -> &[OpinionRecord] {
        self.opinions.as_deref().unwrap_or_default()
    }

    pub fn flags(&self) -> &[RunFlag] {
        self.flags.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_slots() {
        let record = EvidenceRecord::new("goal", true, "src").unwrap();
        let patch = StatePatch::new()
            .with_evidence("source_tree", vec![record])
            .with_flag(RunFlag::new(FlagKind::CollaboratorTimeout, "x", 0, "slow"));
        assert_eq!(patch.written_slots(), vec![Slot::Evidence, Slot::Flags]);
        assert_eq!(patch.evidence_agents().collect::<Vec<_>>(), ["source_tree"]);
        assert!(StatePatch::new().is_empty());
    }

    #[test]
    fn test_with_evidence_accumulates() {
        let a = EvidenceRecord::new("a", true, "").unwrap();
        let b = EvidenceRecord::new("b", false, "").unwrap();
        let patch = StatePatch::new()
            .with_evidence("doc", vec![a])
            .with_evidence("doc", vec![b]);
        assert_eq!(patch.evidence_records().count(), 2);
    }
}
