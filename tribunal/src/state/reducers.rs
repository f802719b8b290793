//! Slot catalogue, reducer kinds and the pure merge functions behind them
//!
//! Every slot of [`WorkflowState`](super::WorkflowState) has a fixed shape, and
//! every shape admits only some reducers. The [`StateSchema`] binds one reducer
//! to each slot and is validated before a graph is accepted.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::store::StateError;
use super::types::Metadata;

/// Named state slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Workspace,
    Document,
    Evidence,
    AggregatedEvidence,
    EvidenceStatus,
    Opinions,
    AggregatedScore,
    Verdict,
    Rationale,
    Flags,
    Metadata,
    IterationCount,
}

/// Structural shape of a slot, constraining which reducers apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotShape {
    /// Single value
    Scalar,
    /// Ordered list
    List,
    /// Map of key to list or value
    KeyedMap,
    /// List of records identified by a key field
    KeyedRecords,
}

impl Slot {
    pub fn all() -> &'static [Slot] {
        &[
            Slot::Workspace,
            Slot::Document,
            Slot::Evidence,
            Slot::AggregatedEvidence,
            Slot::EvidenceStatus,
            Slot::Opinions,
            Slot::AggregatedScore,
            Slot::Verdict,
            Slot::Rationale,
            Slot::Flags,
            Slot::Metadata,
            Slot::IterationCount,
        ]
    }

    pub fn shape(&self) -> SlotShape {
        match self {
            Slot::Evidence | Slot::Metadata => SlotShape::KeyedMap,
            Slot::AggregatedEvidence | Slot::Flags => SlotShape::List,
            Slot::Opinions => SlotShape::KeyedRecords,
            Slot::Workspace
            | Slot::Document
            | Slot::EvidenceStatus
            | Slot::AggregatedScore
            | Slot::Verdict
            | Slot::Rationale
            | Slot::IterationCount => SlotShape::Scalar,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Workspace => "workspace",
            Slot::Document => "document",
            Slot::Evidence => "evidence",
            Slot::AggregatedEvidence => "aggregated_evidence",
            Slot::EvidenceStatus => "evidence_status",
            Slot::Opinions => "opinions",
            Slot::AggregatedScore => "aggregated_score",
            Slot::Verdict => "verdict",
            Slot::Rationale => "rationale",
            Slot::Flags => "flags",
            Slot::Metadata => "metadata",
            Slot::IterationCount => "iteration_count",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge rule applied when a patch writes a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    /// Last writer wins
    Replace,
    /// Concatenate, keeping a canonical order
    AppendList,
    /// Merge key→list maps, concatenating on shared keys
    UnionByKey,
    /// Merge keyed records, newer replaces older with the same key
    UpsertByField,
}

impl ReducerKind {
    /// Whether the merged result is independent of the order patches arrive in
    pub fn is_commutative(&self) -> bool {
        !matches!(self, ReducerKind::Replace)
    }

    /// Whether this reducer can merge a slot of the given shape
    pub fn accepts(&self, shape: SlotShape) -> bool {
        match self {
            ReducerKind::Replace => shape != SlotShape::KeyedRecords,
            ReducerKind::AppendList => shape == SlotShape::List,
            ReducerKind::UnionByKey => shape == SlotShape::KeyedMap,
            ReducerKind::UpsertByField => shape == SlotShape::KeyedRecords,
        }
    }
}

impl std::fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "replace"),
            Self::AppendList => write!(f, "append_list"),
            Self::UnionByKey => write!(f, "union_by_key"),
            Self::UpsertByField => write!(f, "upsert_by_field"),
        }
    }
}

/// Reducer table: which merge rule each slot uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSchema {
    reducers: HashMap<Slot, ReducerKind>,
}

impl Default for StateSchema {
    fn default() -> Self {
        let reducers = Slot::all()
            .iter()
            .map(|slot| {
                let kind = match slot.shape() {
                    SlotShape::Scalar => ReducerKind::Replace,
                    SlotShape::List => match slot {
                        Slot::Flags => ReducerKind::AppendList,
                        _ => ReducerKind::Replace,
                    },
                    SlotShape::KeyedMap => ReducerKind::UnionByKey,
                    SlotShape::KeyedRecords => ReducerKind::UpsertByField,
                };
                (*slot, kind)
            })
            .collect();
        Self { reducers }
    }
}

impl StateSchema {
    /// Schema with no reducers registered
    pub fn empty() -> Self {
        Self {
            reducers: HashMap::new(),
        }
    }

    /// Register or override the reducer for a slot
    pub fn with_reducer(mut self, slot: Slot, kind: ReducerKind) -> Self {
        self.reducers.insert(slot, kind);
        self
    }

    /// Remove the reducer for a slot
    pub fn without_reducer(mut self, slot: Slot) -> Self {
        self.reducers.remove(&slot);
        self
    }

    pub fn reducer(&self, slot: Slot) -> Option<ReducerKind> {
        self.reducers.get(&slot).copied()
    }

    /// Check every registered reducer fits its slot
    ///
    /// Evidence is append-only, so Replace is never accepted there even though
    /// the shape would allow it.
    pub fn validate(&self) -> Result<(), StateError> {
        let mut entries: Vec<_> = self.reducers.iter().collect();
        entries.sort_by_key(|(slot, _)| **slot);

        for (slot, kind) in entries {
            let append_only_violation = *slot == Slot::Evidence && *kind == ReducerKind::Replace;
            if !kind.accepts(slot.shape()) || append_only_violation {
                return Err(StateError::ReducerMismatch {
                    slot: *slot,
                    reducer: *kind,
                });
            }
        }
        Ok(())
    }
}

// ── Merge functions ──

/// Merge `incoming` into `base`, concatenating lists that share a key
///
/// Keys are visited in map order, so the result does not depend on how the
/// incoming map was built.
pub fn union_by_key<K: Ord, V>(base: &mut BTreeMap<K, Vec<V>>, incoming: BTreeMap<K, Vec<V>>) {
    for (key, mut values) in incoming {
        base.entry(key).or_default().append(&mut values);
    }
}

/// Concatenate `incoming` onto `base`, then stable-sort by `key`
///
/// Sorting restores a canonical order so appends from concurrent writers
/// commute.
pub fn append_list<T, K, F>(base: &mut Vec<T>, incoming: Vec<T>, key: F)
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    base.extend(incoming);
    base.sort_by_key(key);
}

/// Upsert records identified by `key`; the incoming record replaces any
/// existing one with the same key. Output stays ordered by key.
pub fn upsert_by_field<T, K, F>(base: &mut Vec<T>, incoming: Vec<T>, key: F)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut merged: BTreeMap<K, T> = BTreeMap::new();
    for record in base.drain(..) {
        merged.insert(key(&record), record);
    }
    for record in incoming {
        merged.insert(key(&record), record);
    }
    base.extend(merged.into_values());
}

/// Union for the free-form metadata map
///
/// Arrays under a shared key are concatenated; any other value is replaced by
/// the incoming one.
pub fn merge_metadata(base: &mut Metadata, incoming: Metadata) {
    for (key, value) in incoming {
        match (base.get_mut(&key), value) {
            (Some(serde_json::Value::Array(existing)), serde_json::Value::Array(mut more)) => {
                existing.append(&mut more);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_is_valid() {
        let schema = StateSchema::default();
        assert!(schema.validate().is_ok());
        assert_eq!(schema.reducer(Slot::Evidence), Some(ReducerKind::UnionByKey));
        assert_eq!(
            schema.reducer(Slot::Opinions),
            Some(ReducerKind::UpsertByField)
        );
        assert_eq!(schema.reducer(Slot::Flags), Some(ReducerKind::AppendList));
        assert_eq!(schema.reducer(Slot::Verdict), Some(ReducerKind::Replace));
        for slot in Slot::all() {
            assert!(schema.reducer(*slot).is_some(), "{slot} has no reducer");
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let schema = StateSchema::default().with_reducer(Slot::AggregatedScore, ReducerKind::UpsertByField);
        assert!(matches!(
            schema.validate(),
            Err(StateError::ReducerMismatch {
                slot: Slot::AggregatedScore,
                ..
            })
        ));

        let schema = StateSchema::default().with_reducer(Slot::Opinions, ReducerKind::Replace);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_evidence_never_replace() {
        let schema = StateSchema::default().with_reducer(Slot::Evidence, ReducerKind::Replace);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_union_by_key_concatenates_shared_keys() {
        let mut base = BTreeMap::from([("a", vec![1]), ("b", vec![2])]);
        union_by_key(&mut base, BTreeMap::from([("a", vec![3]), ("c", vec![4])]));
        assert_eq!(base["a"], vec![1, 3]);
        assert_eq!(base["b"], vec![2]);
        assert_eq!(base["c"], vec![4]);
    }

    #[test]
    fn test_append_list_commutes() {
        let mut left = vec![5, 1];
        append_list(&mut left, vec![3], |v| *v);
        append_list(&mut left, vec![2, 4], |v| *v);

        let mut right = vec![5, 1];
        append_list(&mut right, vec![2, 4], |v| *v);
        append_list(&mut right, vec![3], |v| *v);

        assert_eq!(left, right);
        assert_eq!(left, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_upsert_latest_wins() {
        let mut base = vec![("b", 1), ("a", 1)];
        upsert_by_field(&mut base, vec![("b", 2)], |r| r.0);
        assert_eq!(base, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn test_merge_metadata() {
        let mut base = Metadata::from([
            ("notes".to_string(), serde_json::json!(["first"])),
            ("count".to_string(), serde_json::json!(1)),
        ]);
        merge_metadata(
            &mut base,
            Metadata::from([
                ("notes".to_string(), serde_json::json!(["second"])),
                ("count".to_string(), serde_json::json!(2)),
            ]),
        );
        assert_eq!(base["notes"], serde_json::json!(["first", "second"]));
        assert_eq!(base["count"], serde_json::json!(2));
    }
}
