//! Evidence aggregation: dedup by goal, deterministic ordering
//!
//! Records sharing a goal collapse to the one with the highest confidence.
//! Ties go to the agent ranked first in the priority list; agents not listed
//! rank after all listed ones, ordered by agent id. Ties within one agent
//! keep the earliest record. The output is sorted ascending by goal.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::error::CollaboratorError;
use crate::registry::{Node, NodeContext, NodeKind, NodeOutput};
use crate::state::{AgentId, EvidenceRecord, EvidenceStore, Slot, StatePatch};

/// Pure aggregator over an [`EvidenceStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceAggregator {
    priority: Vec<AgentId>,
}

/// Position of a candidate record, used for tie-breaking
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    record: &'a EvidenceRecord,
    rank: (usize, &'a str),
    position: usize,
}

impl EvidenceAggregator {
    /// Aggregator with the given agent priority, highest first
    pub fn new(priority: impl IntoIterator<Item = impl Into<AgentId>>) -> Self {
        Self {
            priority: priority.into_iter().map(Into::into).collect(),
        }
    }

    pub fn priority(&self) -> &[AgentId] {
        &self.priority
    }

    /// Rank of an agent: listed agents by position, others after them by id
    fn rank<'a>(&self, agent: &'a str) -> (usize, &'a str) {
        match self.priority.iter().position(|p| p == agent) {
            Some(index) => (index, ""),
            None => (self.priority.len(), agent),
        }
    }

    /// Whether `challenger` should replace `incumbent` for the same goal
    fn wins(challenger: &Candidate<'_>, incumbent: &Candidate<'_>) -> bool {
        let by_confidence = challenger
            .record
            .confidence()
            .partial_cmp(&incumbent.record.confidence())
            .unwrap_or(Ordering::Equal);
        match by_confidence {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                (challenger.rank, challenger.position) < (incumbent.rank, incumbent.position)
            }
        }
    }

    /// Collapse the store to one record per goal, ordered by goal
    pub fn aggregate(&self, store: &EvidenceStore) -> Vec<EvidenceRecord> {
        let mut best: BTreeMap<&str, Candidate<'_>> = BTreeMap::new();

        for (agent, records) in store {
            let rank = self.rank(agent);
            for (position, record) in records.iter().enumerate() {
                let candidate = Candidate {
                    record,
                    rank,
                    position,
                };
                let replace = best
                    .get(record.goal())
                    .map_or(true, |incumbent| Self::wins(&candidate, incumbent));
                if replace {
                    best.insert(record.goal(), candidate);
                }
            }
        }

        best.into_values().map(|c| c.record.clone()).collect()
    }
}

/// Aggregator node: reads raw evidence, writes the deduplicated list
pub struct AggregatorNode {
    id: String,
    aggregator: EvidenceAggregator,
}

impl AggregatorNode {
    pub fn new(id: impl Into<String>, aggregator: EvidenceAggregator) -> Self {
        Self {
            id: id.into(),
            aggregator,
        }
    }
}

#[async_trait]
impl Node for AggregatorNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Aggregator
    }

    fn writes(&self) -> &[Slot] {
        &[Slot::AggregatedEvidence, Slot::Metadata]
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
        let state = ctx.state();
        let aggregated = self.aggregator.aggregate(&state.evidence);

        let per_agent: BTreeMap<&str, usize> = state
            .evidence
            .iter()
            .map(|(agent, records)| (agent.as_str(), records.len()))
            .collect();
        let found = aggregated.iter().filter(|r| r.found()).count();

        debug!(node = %self.id, ?per_agent, "Evidence collected");
        info!(
            node = %self.id,
            raw = state.evidence_count(),
            aggregated = aggregated.len(),
            found,
            "Evidence aggregated"
        );

        let patch = StatePatch::new()
            .with_metadata(
                "evidence_counts",
                json!({
                    "raw": state.evidence_count(),
                    "aggregated": aggregated.len(),
                    "found": found,
                    "per_agent": per_agent,
                }),
            )
            .with_aggregated_evidence(aggregated);

        Ok(NodeOutput::patch(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(goal: &str, confidence: f64, location: &str) -> EvidenceRecord {
        EvidenceRecord::new(goal, true, location)
            .unwrap()
            .with_confidence(confidence)
    }

    #[test]
    fn test_higher_confidence_wins() {
        let store = EvidenceStore::from([
            ("a".to_string(), vec![record("X", 0.4, "a")]),
            ("b".to_string(), vec![record("X", 0.9, "b")]),
        ]);
        let out = EvidenceAggregator::default().aggregate(&store);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence(), 0.9);
        assert_eq!(out[0].location(), "b");
    }

    #[test]
    fn test_ties_follow_priority_not_iteration_order() {
        let store = EvidenceStore::from([
            ("alpha".to_string(), vec![record("X", 0.5, "alpha")]),
            ("zulu".to_string(), vec![record("X", 0.5, "zulu")]),
        ]);

        let zulu_first = EvidenceAggregator::new(["zulu", "alpha"]).aggregate(&store);
        assert_eq!(zulu_first[0].location(), "zulu");

        let alpha_first = EvidenceAggregator::new(["alpha"]).aggregate(&store);
        assert_eq!(alpha_first[0].location(), "alpha");
    }

    #[test]
    fn test_unlisted_agents_rank_after_listed_by_id() {
        let store = EvidenceStore::from([
            ("beta".to_string(), vec![record("X", 0.5, "beta")]),
            ("gamma".to_string(), vec![record("X", 0.5, "gamma")]),
            ("omega".to_string(), vec![record("X", 0.5, "omega")]),
        ]);
        let out = EvidenceAggregator::new(["omega"]).aggregate(&store);
        assert_eq!(out[0].location(), "omega");

        let out = EvidenceAggregator::new(["other"]).aggregate(&store);
        assert_eq!(out[0].location(), "beta");
    }

    #[test]
    fn test_same_agent_tie_keeps_earliest() {
        let store = EvidenceStore::from([(
            "a".to_string(),
            vec![record("X", 0.5, "first"), record("X", 0.5, "second")],
        )]);
        let out = EvidenceAggregator::default().aggregate(&store);
        assert_eq!(out[0].location(), "first");
    }

    #[test]
    fn test_sorted_by_goal() {
        let store = EvidenceStore::from([
            ("a".to_string(), vec![record("c", 0.5, ""), record("a", 0.5, "")]),
            ("b".to_string(), vec![record("b", 0.5, "")]),
        ]);
        let goals: Vec<_> = EvidenceAggregator::default()
            .aggregate(&store)
            .iter()
            .map(|r| r.goal().to_string())
            .collect();
        assert_eq!(goals, ["a", "b", "c"]);
    }

    #[test]
    fn test_idempotent() {
        let store = EvidenceStore::from([
            ("a".to_string(), vec![record("X", 0.4, "a"), record("Y", 0.7, "a")]),
            ("b".to_string(), vec![record("X", 0.9, "b"), record("Z", 0.1, "b")]),
        ]);
        let aggregator = EvidenceAggregator::new(["b", "a"]);
        let once = aggregator.aggregate(&store);
        assert_eq!(once, aggregator.aggregate(&store));

        let again = aggregator.aggregate(&EvidenceStore::from([("a".to_string(), once.clone())]));
        assert_eq!(once, again);
    }

    #[test]
    fn test_empty_store() {
        assert!(EvidenceAggregator::default()
            .aggregate(&EvidenceStore::new())
            .is_empty());
    }
}
