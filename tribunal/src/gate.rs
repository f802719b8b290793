//! Quality gate between fact-gathering and judgment
//!
//! The gate proceeds as soon as any aggregated record was found. Otherwise it
//! loops back to the detectives, counting retries; at the ceiling it forces
//! progression and marks the evidence insufficient so termination is
//! guaranteed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CollaboratorError;
use crate::registry::{Node, NodeContext, NodeKind, NodeOutput, Route};
use crate::state::{EvidenceRecord, EvidenceStatus, FlagKind, RunFlag, Slot, StatePatch};

/// Default retry ceiling
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Outcome of one gate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub route: Route,
    /// Iteration count after this evaluation
    pub iteration: u32,
    /// Progression forced at the ceiling without positive evidence
    pub insufficient: bool,
}

impl GateDecision {
    pub fn evidence_status(&self) -> EvidenceStatus {
        match (self.route, self.insufficient) {
            (Route::Proceed, false) => EvidenceStatus::Sufficient,
            (Route::Proceed, true) => EvidenceStatus::Insufficient,
            (Route::Retry, _) => EvidenceStatus::Pending,
        }
    }
}

/// Pure retry/proceed policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    pub max_retries: u32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl QualityGate {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide on the aggregated evidence at the given iteration count
    pub fn evaluate(&self, evidence: &[EvidenceRecord], iteration: u32) -> GateDecision {
        if evidence.iter().any(EvidenceRecord::found) {
            return GateDecision {
                route: Route::Proceed,
                iteration,
                insufficient: false,
            };
        }

        if iteration < self.max_retries {
            GateDecision {
                route: Route::Retry,
                iteration: iteration + 1,
                insufficient: false,
            }
        } else {
            GateDecision {
                route: Route::Proceed,
                iteration,
                insufficient: true,
            }
        }
    }
}

/// Router node wrapping [`QualityGate`]
pub struct QualityGateNode {
    id: String,
    gate: QualityGate,
}

impl QualityGateNode {
    pub fn new(id: impl Into<String>, gate: QualityGate) -> Self {
        Self {
            id: id.into(),
            gate,
        }
    }
}

#[async_trait]
impl Node for QualityGateNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Router
    }

    fn writes(&self) -> &[Slot] {
        &[Slot::IterationCount, Slot::EvidenceStatus, Slot::Flags]
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
        let state = ctx.state();
        let decision = self
            .gate
            .evaluate(&state.aggregated_evidence, state.iteration_count);

        let mut patch = StatePatch::new()
            .with_iteration_count(decision.iteration)
            .with_evidence_status(decision.evidence_status());

        if decision.insufficient {
            warn!(
                node = %self.id,
                iteration = decision.iteration,
                max_retries = self.gate.max_retries,
                "Retry ceiling reached without positive evidence, proceeding"
            );
            patch = patch.with_flag(RunFlag::new(
                FlagKind::RetryCeilingExceeded,
                self.id.clone(),
                decision.iteration,
                format!(
                    "no positive evidence after {} retries; proceeding with insufficient evidence",
                    self.gate.max_retries
                ),
            ));
        } else {
            info!(
                node = %self.id,
                route = %decision.route,
                iteration = decision.iteration,
                records = state.aggregated_evidence.len(),
                "Gate evaluated"
            );
        }

        Ok(NodeOutput::routed(patch, decision.route))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::state::{DocumentRef, WorkflowState};

    fn record(found: bool) -> EvidenceRecord {
        EvidenceRecord::new("goal", found, "loc").unwrap()
    }

    #[test]
    fn test_any_found_proceeds() {
        let gate = QualityGate::default();
        let decision = gate.evaluate(&[record(false), record(true)], 0);
        assert_eq!(decision.route, Route::Proceed);
        assert_eq!(decision.iteration, 0);
        assert!(!decision.insufficient);
        assert_eq!(decision.evidence_status(), EvidenceStatus::Sufficient);
    }

    #[test]
    fn test_empty_and_all_false_retry() {
        let gate = QualityGate::default();
        for evidence in [vec![], vec![record(false), record(false)]] {
            let decision = gate.evaluate(&evidence, 1);
            assert_eq!(decision.route, Route::Retry);
            assert_eq!(decision.iteration, 2);
        }
    }

    #[test]
    fn test_ceiling_forces_proceed() {
        let gate = QualityGate::new(3);
        let mut iteration = 0;
        let mut evaluations = 0;
        loop {
            evaluations += 1;
            let decision = gate.evaluate(&[], iteration);
            iteration = decision.iteration;
            if decision.route == Route::Proceed {
                assert!(decision.insufficient);
                break;
            }
            assert!(evaluations < 10, "gate did not terminate");
        }
        assert_eq!(evaluations, 4);
        assert_eq!(iteration, 3);
    }

    #[test]
    fn test_zero_ceiling_proceeds_immediately() {
        let decision = QualityGate::new(0).evaluate(&[], 0);
        assert_eq!(decision.route, Route::Proceed);
        assert!(decision.insufficient);
    }

    #[tokio::test]
    async fn test_gate_node_flags_forced_progression() {
        let mut state = WorkflowState::new("/tmp", DocumentRef::Absent);
        state.iteration_count = 3;
        let node = QualityGateNode::new("quality_gate", QualityGate::new(3));

        let output = node.run(NodeContext::new(Arc::new(state))).await.unwrap();
        assert_eq!(output.route, Some(Route::Proceed));
        assert_eq!(output.patch.flags().len(), 1);
        assert_eq!(output.patch.flags()[0].kind, FlagKind::RetryCeilingExceeded);
    }
}
