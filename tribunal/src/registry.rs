//! Node trait and registry.
//!
//! A node maps an immutable state snapshot to a [`StatePatch`]. Nodes are
//! tagged with a [`NodeKind`] that fixes which slots they may write:
//!
//! ```text
//! Detective    → evidence, flags
//! Aggregator   → aggregated_evidence, metadata, flags
//! Router       → iteration_count, evidence_status, metadata, flags
//! Judge        → opinions, flags
//! Synthesizer  → aggregated_score, verdict, rationale, metadata, flags
//! ```
//!
//! Workspace and document are seeded at run creation and never written by a
//! node.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::state::{JudgeId, Slot, StatePatch, WorkflowState};

// ── Kinds and routes ─────────────────────────────────────────────────────────

/// Role of a node in the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Detective,
    Aggregator,
    Router,
    Judge,
    Synthesizer,
}

impl NodeKind {
    /// Slots a node of this kind may write
    pub fn permitted_slots(self) -> &'static [Slot] {
        match self {
            Self::Detective => &[Slot::Evidence, Slot::Flags],
            Self::Aggregator => &[Slot::AggregatedEvidence, Slot::Metadata, Slot::Flags],
            Self::Router => &[
                Slot::IterationCount,
                Slot::EvidenceStatus,
                Slot::Metadata,
                Slot::Flags,
            ],
            Self::Judge => &[Slot::Opinions, Slot::Flags],
            Self::Synthesizer => &[
                Slot::AggregatedScore,
                Slot::Verdict,
                Slot::Rationale,
                Slot::Metadata,
                Slot::Flags,
            ],
        }
    }

    pub fn permits(self, slot: Slot) -> bool {
        self.permitted_slots().contains(&slot)
    }

    /// Whether a failure of this kind can be isolated instead of aborting
    pub fn is_isolatable(self) -> bool {
        matches!(self, Self::Detective | Self::Judge)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detective => write!(f, "detective"),
            Self::Aggregator => write!(f, "aggregator"),
            Self::Router => write!(f, "router"),
            Self::Judge => write!(f, "judge"),
            Self::Synthesizer => write!(f, "synthesizer"),
        }
    }
}

/// Routing decision returned by a router node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Loop back to fact-gathering
    Retry,
    /// Advance to judgment
    Proceed,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Proceed => write!(f, "proceed"),
        }
    }
}

// ── Context / Output ─────────────────────────────────────────────────────────

/// Input handed to every node invocation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Immutable snapshot taken when the node was dispatched
    pub snapshot: Arc<WorkflowState>,
    /// Gate iteration the node runs in
    pub iteration: u32,
}

impl NodeContext {
    pub fn new(snapshot: Arc<WorkflowState>) -> Self {
        let iteration = snapshot.iteration_count;
        Self {
            snapshot,
            iteration,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.snapshot
    }
}

/// Result of a successful node invocation.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub patch: StatePatch,
    /// Set by router nodes only
    pub route: Option<Route>,
}

impl NodeOutput {
    pub fn patch(patch: StatePatch) -> Self {
        Self { patch, route: None }
    }

    pub fn routed(patch: StatePatch, route: Route) -> Self {
        Self {
            patch,
            route: Some(route),
        }
    }
}

// ── Node trait ───────────────────────────────────────────────────────────────

/// A unit of work in the workflow graph.
///
/// Implementors must not hold shared mutable state across invocations; all
/// effects go through the returned patch.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique id within the graph. For detectives this is also the agent id
    /// their evidence is keyed under.
    fn id(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Slots this node's patches may write.
    fn writes(&self) -> &[Slot];

    /// Judge identity, for judge nodes.
    fn judge_id(&self) -> Option<JudgeId> {
        None
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError>;

    /// Substitute patch for a failed invocation. `None` makes the failure
    /// fatal to the run.
    fn fallback(&self, _ctx: &NodeContext, _failure: &CollaboratorError) -> Option<StatePatch> {
        None
    }
}

/// Shared reference to a registered node
pub type SharedNode = Arc<dyn Node>;

/// Error raised when registering nodes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Node id must not be empty")]
    EmptyId,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
}

/// Nodes by id, in id order
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, SharedNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: SharedNode) -> Result<(), RegistryError> {
        let id = node.id().to_string();
        if id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if self.nodes.contains_key(&id) {
            return Err(RegistryError::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SharedNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SharedNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Node ids of the given kind
    pub fn of_kind(&self, kind: NodeKind) -> Vec<&str> {
        self.iter()
            .filter(|(_, node)| node.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.nodes.iter().map(|(id, node)| (id, node.kind())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(&'static str, NodeKind);

    #[async_trait]
    impl Node for Stub {
        fn id(&self) -> &str {
            self.0
        }
        fn kind(&self) -> NodeKind {
            self.1
        }
        fn writes(&self) -> &[Slot] {
            self.1.permitted_slots()
        }
        async fn run(&self, _ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
            Ok(NodeOutput::default())
        }
    }

    #[test]
    fn test_no_kind_writes_seeded_slots() {
        for kind in [
            NodeKind::Detective,
            NodeKind::Aggregator,
            NodeKind::Router,
            NodeKind::Judge,
            NodeKind::Synthesizer,
        ] {
            assert!(!kind.permits(Slot::Workspace));
            assert!(!kind.permits(Slot::Document));
        }
    }

    #[test]
    fn test_only_router_writes_iteration() {
        assert!(NodeKind::Router.permits(Slot::IterationCount));
        assert!(!NodeKind::Detective.permits(Slot::IterationCount));
        assert!(!NodeKind::Judge.permits(Slot::Verdict));
        assert!(NodeKind::Synthesizer.permits(Slot::Verdict));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = NodeRegistry::new();
        registry
            .register(Arc::new(Stub("source_tree", NodeKind::Detective)))
            .unwrap();
        assert_eq!(
            registry.register(Arc::new(Stub("source_tree", NodeKind::Judge))),
            Err(RegistryError::DuplicateNode("source_tree".into()))
        );
        assert_eq!(
            registry.register(Arc::new(Stub("", NodeKind::Judge))),
            Err(RegistryError::EmptyId)
        );
        assert_eq!(registry.of_kind(NodeKind::Detective), vec!["source_tree"]);
    }
}
