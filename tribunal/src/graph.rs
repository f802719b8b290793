//! Workflow graph construction and validation
//!
//! A graph is built once, validated against the state schema, and then
//! handed to the scheduler read-only. Validation catches every state
//! invariant violation that can be detected statically:
//!
//! - unknown node ids, self-loops, cycles among static edges
//! - routers without a route table, route tables on non-routers
//! - nodes unreachable from the entry set
//! - writes outside a node kind's permitted slots, or to slots without a
//!   reducer
//! - two nodes that can run concurrently both writing a Replace slot
//!
//! Static edges define join barriers: a node waits for all of its static
//! predecessors. Route edges are taken only when the router chooses them and
//! bypass the barrier.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use tracing::debug;

use crate::registry::{NodeKind, NodeRegistry, RegistryError, Route, SharedNode};
use crate::state::{JudgeId, ReducerKind, Slot, StateError, StateSchema};

/// Error type for graph validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Schema(#[from] StateError),

    #[error("Graph has no entry node")]
    NoEntry,

    #[error("Unknown node '{id}' referenced by {context}")]
    UnknownNode { id: String, context: String },

    #[error("Self-loop on node '{0}'")]
    SelfLoop(String),

    #[error("Static edges form a cycle through '{0}'")]
    Cycle(String),

    #[error("Router '{0}' has no route table")]
    MissingRouteTable(String),

    #[error("Node '{0}' is not a router but has a route table")]
    UnexpectedRouteTable(String),

    #[error("Router '{router}' has no targets for route '{route}'")]
    EmptyRoute { router: String, route: Route },

    #[error("Router '{0}' must not have static successors")]
    RouterStaticEdge(String),

    #[error("Node '{0}' is unreachable from the entry nodes")]
    Unreachable(String),

    #[error("Node '{node}' ({kind}) may not write slot '{slot}'")]
    ForbiddenWrite {
        node: String,
        kind: NodeKind,
        slot: Slot,
    },

    #[error("Node '{node}' writes slot '{slot}' which has no reducer")]
    MissingReducer { node: String, slot: Slot },

    #[error("Concurrent nodes '{first}' and '{second}' both write Replace slot '{slot}'")]
    ConcurrentReplace {
        slot: Slot,
        first: String,
        second: String,
    },

    #[error("Judge node '{0}' declares no judge identity")]
    MissingJudgeId(String),

    #[error("Judge identity '{judge}' is claimed by both '{first}' and '{second}'")]
    DuplicateJudge {
        judge: JudgeId,
        first: String,
        second: String,
    },
}

/// Targets for each outcome of a router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub retry: Vec<String>,
    pub proceed: Vec<String>,
}

impl RouteTable {
    pub fn targets(&self, route: Route) -> &[String] {
        match route {
            Route::Retry => &self.retry,
            Route::Proceed => &self.proceed,
        }
    }

    fn all(&self) -> impl Iterator<Item = &String> {
        self.retry.iter().chain(self.proceed.iter())
    }
}

/// Incremental graph builder
///
/// Registration errors are deferred to [`GraphBuilder::build`] so the
/// builder chains without intermediate `?`.
#[derive(Default)]
pub struct GraphBuilder {
    registry: NodeRegistry,
    entries: Vec<String>,
    edges: BTreeSet<(String, String)>,
    routes: BTreeMap<String, RouteTable>,
    errors: Vec<GraphError>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: SharedNode) -> Self {
        if let Err(e) = self.registry.register(node) {
            self.errors.push(e.into());
        }
        self
    }

    /// Mark a node as an entry point; may be called more than once
    pub fn entry(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.entries.contains(&id) {
            self.entries.push(id);
        }
        self
    }

    /// Static edge; `to` waits for `from` (and any other predecessors)
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert((from.into(), to.into()));
        self
    }

    /// One predecessor triggering several successors
    pub fn fan_out(mut self, from: &str, to: &[&str]) -> Self {
        for target in to {
            self = self.edge(from, *target);
        }
        self
    }

    /// Join barrier: `to` runs only after every node in `from` completed
    pub fn join(mut self, from: &[&str], to: &str) -> Self {
        for source in from {
            self = self.edge(*source, to);
        }
        self
    }

    /// Route table for a router node
    pub fn route(mut self, router: &str, retry: &[&str], proceed: &[&str]) -> Self {
        let table = RouteTable {
            retry: retry.iter().map(|s| s.to_string()).collect(),
            proceed: proceed.iter().map(|s| s.to_string()).collect(),
        };
        self.routes.insert(router.to_string(), table);
        self
    }

    /// Validate and freeze the graph
    pub fn build(self, schema: &StateSchema) -> Result<WorkflowGraph, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        schema.validate()?;

        let registry = self.registry;
        let require = |id: &str, context: &str| -> Result<(), GraphError> {
            if registry.contains(id) {
                Ok(())
            } else {
                Err(GraphError::UnknownNode {
                    id: id.to_string(),
                    context: context.to_string(),
                })
            }
        };

        if self.entries.is_empty() {
            return Err(GraphError::NoEntry);
        }
        for id in &self.entries {
            require(id, "entry")?;
        }
        for (from, to) in &self.edges {
            require(from, "edge source")?;
            require(to, &format!("edge from '{}'", from))?;
            if from == to {
                return Err(GraphError::SelfLoop(from.clone()));
            }
        }

        // Route tables
        for (router, table) in &self.routes {
            require(router, "route table")?;
            for target in table.all() {
                require(target, &format!("route of '{}'", router))?;
            }
        }
        for (id, node) in registry.iter() {
            let is_router = node.kind() == NodeKind::Router;
            match (is_router, self.routes.get(id)) {
                (true, None) => return Err(GraphError::MissingRouteTable(id.to_string())),
                (false, Some(_)) => return Err(GraphError::UnexpectedRouteTable(id.to_string())),
                (true, Some(table)) => {
                    for route in [Route::Retry, Route::Proceed] {
                        if table.targets(route).is_empty() {
                            return Err(GraphError::EmptyRoute {
                                router: id.to_string(),
                                route,
                            });
                        }
                    }
                    if self.edges.iter().any(|(from, _)| from == id) {
                        return Err(GraphError::RouterStaticEdge(id.to_string()));
                    }
                }
                (false, None) => {}
            }
        }

        // Node permissions and reducers
        let mut judges: BTreeMap<JudgeId, String> = BTreeMap::new();
        for (id, node) in registry.iter() {
            let kind = node.kind();
            for slot in &effective_writes(node) {
                if !kind.permits(*slot) {
                    return Err(GraphError::ForbiddenWrite {
                        node: id.to_string(),
                        kind,
                        slot: *slot,
                    });
                }
                if schema.reducer(*slot).is_none() {
                    return Err(GraphError::MissingReducer {
                        node: id.to_string(),
                        slot: *slot,
                    });
                }
            }
            if kind == NodeKind::Judge {
                let judge = node
                    .judge_id()
                    .ok_or_else(|| GraphError::MissingJudgeId(id.to_string()))?;
                if let Some(first) = judges.insert(judge, id.to_string()) {
                    return Err(GraphError::DuplicateJudge {
                        judge,
                        first,
                        second: id.to_string(),
                    });
                }
            }
        }

        // Petgraph views: static edges, forward edges, all edges
        let index: HashMap<&str, usize> = registry.ids().enumerate().map(|(i, id)| (id, i)).collect();
        let ids: Vec<&str> = registry.ids().collect();
        let mut static_graph: DiGraph<&str, ()> = DiGraph::new();
        for id in &ids {
            static_graph.add_node(*id);
        }
        let mut full_graph = static_graph.clone();
        let node_ix = |id: &str| NodeIndex::new(index[id]);

        for (from, to) in &self.edges {
            static_graph.add_edge(node_ix(from), node_ix(to), ());
            full_graph.add_edge(node_ix(from), node_ix(to), ());
        }

        if let Err(cycle) = toposort(&static_graph, None) {
            return Err(GraphError::Cycle(static_graph[cycle.node_id()].to_string()));
        }

        let mut forward_graph = static_graph.clone();
        for (router, table) in &self.routes {
            for target in table.all() {
                full_graph.add_edge(node_ix(router), node_ix(target), ());
                // A route back to a static ancestor is a loop, not a forward step
                let is_back_edge =
                    has_path_connecting(&static_graph, node_ix(target), node_ix(router), None);
                if !is_back_edge {
                    forward_graph.add_edge(node_ix(router), node_ix(target), ());
                }
            }
        }

        // Reachability from the entry set over every edge
        let mut reached = BTreeSet::new();
        for entry in &self.entries {
            let mut bfs = Bfs::new(&full_graph, node_ix(entry));
            while let Some(ix) = bfs.next(&full_graph) {
                reached.insert(full_graph[ix]);
            }
        }
        if let Some(missing) = ids.iter().find(|id| !reached.contains(*id)) {
            return Err(GraphError::Unreachable(missing.to_string()));
        }

        // Concurrent Replace writers
        for (i, first) in ids.iter().enumerate() {
            for second in &ids[i + 1..] {
                let ordered = has_path_connecting(&forward_graph, node_ix(first), node_ix(second), None)
                    || has_path_connecting(&forward_graph, node_ix(second), node_ix(first), None);
                if ordered {
                    continue;
                }
                let (Some(a), Some(b)) = (registry.get(first), registry.get(second)) else {
                    continue;
                };
                let b_writes = effective_writes(b);
                for slot in &effective_writes(a) {
                    let shared = b_writes.contains(slot);
                    if shared && schema.reducer(*slot) == Some(ReducerKind::Replace) {
                        return Err(GraphError::ConcurrentReplace {
                            slot: *slot,
                            first: first.to_string(),
                            second: second.to_string(),
                        });
                    }
                }
            }
        }

        let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut predecessors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, to) in &self.edges {
            successors.entry(from.clone()).or_default().push(to.clone());
            predecessors
                .entry(to.clone())
                .or_default()
                .insert(from.clone());
        }

        debug!(
            nodes = registry.len(),
            edges = self.edges.len(),
            routers = self.routes.len(),
            "Workflow graph validated"
        );

        Ok(WorkflowGraph {
            registry,
            entries: self.entries,
            successors,
            predecessors,
            routes: self.routes,
        })
    }
}

/// Declared writes plus the flag a failed isolatable node is recorded with
fn effective_writes(node: &SharedNode) -> Vec<Slot> {
    let mut writes = node.writes().to_vec();
    if node.kind().is_isolatable() && !writes.contains(&Slot::Flags) {
        writes.push(Slot::Flags);
    }
    writes
}

/// Validated, immutable workflow graph
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    registry: NodeRegistry,
    entries: Vec<String>,
    successors: BTreeMap<String, Vec<String>>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
    routes: BTreeMap<String, RouteTable>,
}

impl WorkflowGraph {
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn node(&self, id: &str) -> Option<&SharedNode> {
        self.registry.get(id)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Static successors of a node
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Static predecessors a node waits for
    pub fn predecessors(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.predecessors.get(id)
    }

    pub fn route_targets(&self, router: &str, route: Route) -> Option<&[String]> {
        self.routes.get(router).map(|table| table.targets(route))
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::CollaboratorError;
    use crate::registry::{Node, NodeContext, NodeOutput};

    struct Fake {
        id: &'static str,
        kind: NodeKind,
        writes: Vec<Slot>,
        judge: Option<JudgeId>,
    }

    fn fake(id: &'static str, kind: NodeKind) -> Arc<Fake> {
        Arc::new(Fake {
            id,
            kind,
            writes: kind.permitted_slots().to_vec(),
            judge: None,
        })
    }

    fn judge(id: &'static str, judge: JudgeId) -> Arc<Fake> {
        Arc::new(Fake {
            id,
            kind: NodeKind::Judge,
            writes: vec![Slot::Opinions],
            judge: Some(judge),
        })
    }

    #[async_trait]
    impl Node for Fake {
        fn id(&self) -> &str {
            self.id
        }
        fn kind(&self) -> NodeKind {
            self.kind
        }
        fn writes(&self) -> &[Slot] {
            &self.writes
        }
        fn judge_id(&self) -> Option<JudgeId> {
            self.judge
        }
        async fn run(&self, _ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
            Ok(NodeOutput::default())
        }
    }

    fn audit_shape() -> GraphBuilder {
        GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("b", NodeKind::Detective))
            .node(fake("agg", NodeKind::Aggregator))
            .node(fake("gate", NodeKind::Router))
            .node(judge("p", JudgeId::Prosecutor))
            .node(judge("d", JudgeId::Defense))
            .node(fake("synth", NodeKind::Synthesizer))
            .entry("a")
            .entry("b")
            .join(&["a", "b"], "agg")
            .edge("agg", "gate")
            .route("gate", &["a", "b"], &["p", "d"])
            .join(&["p", "d"], "synth")
    }

    #[test]
    fn test_valid_graph_builds() {
        let graph = audit_shape().build(&StateSchema::default()).unwrap();
        assert_eq!(graph.len(), 7);
        assert_eq!(graph.predecessors("agg").unwrap().len(), 2);
        assert_eq!(graph.successors("agg"), ["gate"]);
        assert_eq!(
            graph.route_targets("gate", Route::Proceed).unwrap(),
            ["p", "d"]
        );
        assert!(graph.predecessors("a").is_none());
    }

    #[test]
    fn test_concurrent_replace_writers_rejected() {
        // Two aggregators after the same join both write aggregated_evidence
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("agg1", NodeKind::Aggregator))
            .node(fake("agg2", NodeKind::Aggregator))
            .entry("a")
            .fan_out("a", &["agg1", "agg2"])
            .build(&StateSchema::default())
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::ConcurrentReplace {
                slot: Slot::AggregatedEvidence,
                ..
            }
        ));
    }

    #[test]
    fn test_sequential_replace_writers_allowed() {
        let graph = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("agg1", NodeKind::Aggregator))
            .node(fake("agg2", NodeKind::Aggregator))
            .entry("a")
            .edge("a", "agg1")
            .edge("agg1", "agg2")
            .build(&StateSchema::default());
        assert!(graph.is_ok());
    }

    #[test]
    fn test_concurrent_writers_with_commutative_reducer_allowed() {
        // Parallel detectives share evidence and flags, both commutative
        assert!(audit_shape().build(&StateSchema::default()).is_ok());

        let schema = StateSchema::default().with_reducer(Slot::Flags, ReducerKind::Replace);
        assert!(matches!(
            audit_shape().build(&schema),
            Err(GraphError::ConcurrentReplace {
                slot: Slot::Flags,
                ..
            })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("b", NodeKind::Detective))
            .entry("a")
            .edge("a", "b")
            .edge("b", "a")
            .build(&StateSchema::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_forbidden_write_rejected() {
        let bad = Arc::new(Fake {
            id: "sneaky",
            kind: NodeKind::Detective,
            writes: vec![Slot::Verdict],
            judge: None,
        });
        let err = GraphBuilder::new()
            .node(bad)
            .entry("sneaky")
            .build(&StateSchema::default())
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::ForbiddenWrite {
                node: "sneaky".into(),
                kind: NodeKind::Detective,
                slot: Slot::Verdict
            }
        );
    }

    #[test]
    fn test_missing_reducer_rejected() {
        let schema = StateSchema::default().without_reducer(Slot::Opinions);
        assert!(matches!(
            audit_shape().build(&schema),
            Err(GraphError::MissingReducer {
                slot: Slot::Opinions,
                ..
            })
        ));
    }

    #[test]
    fn test_router_requires_route_table() {
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("gate", NodeKind::Router))
            .entry("a")
            .edge("a", "gate")
            .build(&StateSchema::default())
            .unwrap_err();
        assert_eq!(err, GraphError::MissingRouteTable("gate".into()));
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("orphan", NodeKind::Synthesizer))
            .entry("a")
            .build(&StateSchema::default())
            .unwrap_err();
        assert_eq!(err, GraphError::Unreachable("orphan".into()));
    }

    #[test]
    fn test_duplicate_judge_identity_rejected() {
        let err = GraphBuilder::new()
            .node(judge("p1", JudgeId::Prosecutor))
            .node(judge("p2", JudgeId::Prosecutor))
            .entry("p1")
            .entry("p2")
            .build(&StateSchema::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateJudge { .. }));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .entry("a")
            .edge("a", "ghost")
            .build(&StateSchema::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode { ref id, .. } if id == "ghost"));
    }

    #[test]
    fn test_duplicate_registration_surfaces_at_build() {
        let err = GraphBuilder::new()
            .node(fake("a", NodeKind::Detective))
            .node(fake("a", NodeKind::Detective))
            .entry("a")
            .build(&StateSchema::default())
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::Registry(RegistryError::DuplicateNode("a".into()))
        );
    }
}
