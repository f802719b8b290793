//! In-memory state store for one audit run
//!
//! The store owns the canonical [`WorkflowState`] and is written only by the
//! scheduler. Readers get an `Arc` snapshot; a merge after a snapshot was
//! taken copies the state, so in-flight nodes never observe a partial write.

use std::sync::Arc;

use tracing::trace;

use super::patch::StatePatch;
use super::reducers::{
    append_list, merge_metadata, union_by_key, upsert_by_field, ReducerKind, Slot, StateSchema,
};
use super::types::*;

/// Error type for state store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("No reducer registered for slot '{0}'")]
    MissingReducer(Slot),

    #[error("Reducer '{reducer}' cannot merge slot '{slot}'")]
    ReducerMismatch { slot: Slot, reducer: ReducerKind },

    #[error("State invariant violated on '{slot}': {detail}")]
    InvariantViolation { slot: Slot, detail: String },
}

/// Result type for state store operations
pub type StateResult<T> = Result<T, StateError>;

/// Canonical state plus the reducer table used to merge patches into it
#[derive(Debug)]
pub struct StateStore {
    state: Arc<WorkflowState>,
    schema: StateSchema,
    merges: u64,
}

impl StateStore {
    /// Wrap an initial state; the schema is validated up front
    pub fn new(state: WorkflowState, schema: StateSchema) -> StateResult<Self> {
        schema.validate()?;
        Ok(Self {
            state: Arc::new(state),
            schema,
            merges: 0,
        })
    }

    /// Immutable snapshot of the current state
    pub fn snapshot(&self) -> Arc<WorkflowState> {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Number of patches merged so far
    pub fn merges(&self) -> u64 {
        self.merges
    }

    /// Consume the store, returning the final state
    pub fn into_state(self) -> WorkflowState {
        Arc::try_unwrap(self.state).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Merge a patch through the registered reducers
    ///
    /// All written slots are checked before anything is mutated, so a
    /// rejected patch leaves the state untouched.
    pub fn apply(&mut self, patch: StatePatch) -> StateResult<()> {
        let slots = patch.written_slots();
        let mut plan = Vec::with_capacity(slots.len());
        for slot in &slots {
            let reducer = self
                .schema
                .reducer(*slot)
                .ok_or(StateError::MissingReducer(*slot))?;
            if !reducer.accepts(slot.shape()) {
                return Err(StateError::ReducerMismatch {
                    slot: *slot,
                    reducer,
                });
            }
            plan.push((*slot, reducer));
        }

        if let Some(next) = patch.iteration_count {
            if next < self.state.iteration_count {
                return Err(StateError::InvariantViolation {
                    slot: Slot::IterationCount,
                    detail: format!(
                        "iteration count would decrease from {} to {}",
                        self.state.iteration_count, next
                    ),
                });
            }
        }

        let reducer_for = |slot: Slot| {
            plan.iter()
                .find(|(s, _)| *s == slot)
                .map(|(_, r)| *r)
                .unwrap_or(ReducerKind::Replace)
        };

        let state = Arc::make_mut(&mut self.state);
        let StatePatch {
            workspace,
            document,
            evidence,
            aggregated_evidence,
            evidence_status,
            opinions,
            aggregated_score,
            verdict,
            rationale,
            flags,
            metadata,
            iteration_count,
        } = patch;

        if let Some(workspace) = workspace {
            state.workspace = workspace;
        }
        if let Some(document) = document {
            state.document = document;
        }
        if let Some(incoming) = evidence {
            // Schema validation forbids Replace here
            union_by_key(&mut state.evidence, incoming);
        }
        if let Some(incoming) = aggregated_evidence {
            match reducer_for(Slot::AggregatedEvidence) {
                ReducerKind::AppendList => append_list(
                    &mut state.aggregated_evidence,
                    incoming,
                    |r: &EvidenceRecord| r.goal().to_string(),
                ),
                _ => state.aggregated_evidence = incoming,
            }
        }
        if let Some(status) = evidence_status {
            state.evidence_status = status;
        }
        if let Some(incoming) = opinions {
            upsert_by_field(&mut state.opinions, incoming, |o: &OpinionRecord| {
                o.judge_id()
            });
        }
        if let Some(score) = aggregated_score {
            state.aggregated_score = score;
        }
        if let Some(verdict) = verdict {
            state.verdict = verdict;
        }
        if let Some(rationale) = rationale {
            state.rationale = rationale;
        }
        if let Some(incoming) = flags {
            match reducer_for(Slot::Flags) {
                ReducerKind::AppendList => {
                    append_list(&mut state.flags, incoming, |f: &RunFlag| f.clone())
                }
                _ => state.flags = incoming,
            }
        }
        if let Some(incoming) = metadata {
            match reducer_for(Slot::Metadata) {
                ReducerKind::UnionByKey => merge_metadata(&mut state.metadata, incoming),
                _ => state.metadata = incoming,
            }
        }
        if let Some(iteration) = iteration_count {
            state.iteration_count = iteration;
        }

        self.merges += 1;
        trace!(slots = ?slots, merges = self.merges, "Patch merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::new(
            WorkflowState::new("/tmp/ws", DocumentRef::Absent),
            StateSchema::default(),
        )
        .unwrap()
    }

    fn record(goal: &str, found: bool) -> EvidenceRecord {
        EvidenceRecord::new(goal, found, "loc").unwrap()
    }

    #[test]
    fn test_evidence_is_append_only() {
        let mut store = store();
        store
            .apply(StatePatch::new().with_evidence("docs", vec![record("a", false)]))
            .unwrap();
        store
            .apply(StatePatch::new().with_evidence("docs", vec![record("a", true)]))
            .unwrap();

        let docs = &store.state().evidence["docs"];
        assert_eq!(docs.len(), 2);
        assert!(!docs[0].found());
        assert!(docs[1].found());
    }

    #[test]
    fn test_opinions_latest_wins_per_judge() {
        let range = ScoreRange::default();
        let mut store = store();
        let first = OpinionRecord::new(JudgeId::Defense, 2.0, "first", &range).unwrap();
        let second = OpinionRecord::new(JudgeId::Defense, 4.0, "second", &range).unwrap();
        let other = OpinionRecord::new(JudgeId::Prosecutor, 1.0, "other", &range).unwrap();

        store.apply(StatePatch::new().with_opinion(first)).unwrap();
        store.apply(StatePatch::new().with_opinion(other)).unwrap();
        store.apply(StatePatch::new().with_opinion(second)).unwrap();

        let opinions = &store.state().opinions;
        assert_eq!(opinions.len(), 2);
        assert_eq!(opinions[0].judge_id(), JudgeId::Prosecutor);
        assert_eq!(opinions[1].rationale(), "second");
    }

    #[test]
    fn test_iteration_count_never_decreases() {
        let mut store = store();
        store
            .apply(StatePatch::new().with_iteration_count(2))
            .unwrap();
        let err = store
            .apply(StatePatch::new().with_iteration_count(1).with_verdict(Verdict::Elite))
            .unwrap_err();
        assert!(matches!(err, StateError::InvariantViolation { .. }));
        // Rejected patch left nothing behind
        assert_eq!(store.state().verdict, Verdict::Void);
        assert_eq!(store.state().iteration_count, 2);
    }

    #[test]
    fn test_missing_reducer_is_error() {
        let schema = StateSchema::default().without_reducer(Slot::Rationale);
        let mut store =
            StateStore::new(WorkflowState::new("/tmp", DocumentRef::Absent), schema).unwrap();
        assert_eq!(
            store.apply(StatePatch::new().with_rationale("x")),
            Err(StateError::MissingReducer(Slot::Rationale))
        );
    }

    #[test]
    fn test_snapshot_isolated_from_later_merges() {
        let mut store = store();
        let before = store.snapshot();
        store
            .apply(StatePatch::new().with_evidence("src", vec![record("a", true)]))
            .unwrap();
        assert!(before.evidence.is_empty());
        assert_eq!(store.snapshot().evidence_count(), 1);
    }

    #[test]
    fn test_flags_kept_in_canonical_order() {
        let mut store = store();
        let late = RunFlag::new(FlagKind::MalformedJudgment, "defense", 0, "bad");
        let early = RunFlag::new(FlagKind::CollaboratorUnavailable, "document", 0, "missing");
        store.apply(StatePatch::new().with_flag(late.clone())).unwrap();
        store.apply(StatePatch::new().with_flag(early.clone())).unwrap();
        assert_eq!(store.state().flags, vec![early, late]);
    }

    #[test]
    fn test_metadata_union() {
        let mut store = store();
        store
            .apply(StatePatch::new().with_metadata("evidence_count", serde_json::json!(3)))
            .unwrap();
        assert!(store.state().run_id().is_some());
        assert_eq!(store.state().metadata["evidence_count"], serde_json::json!(3));
    }
}
