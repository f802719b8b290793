//! Graph scheduler: JoinSet fan-out, join barriers, serialized merges
//!
//! ```text
//! Scheduler::run(state)
//!   → ready ← entry nodes
//!   → loop:
//!       spawn every ready node on the JoinSet (Semaphore-bounded, each with
//!         an Arc snapshot and a per-node timeout)
//!       join_next() → merge its patch through the reducers
//!       router   → enqueue the chosen route's targets
//!       otherwise → mark the edge fired; enqueue successors whose static
//!                   predecessors have all fired
//!   → terminal when nothing is ready or in flight
//! ```
//!
//! Node execution is parallel; merges are not. The scheduler is the only
//! writer of the state store. A node that errors, times out or panics is
//! replaced by its fallback patch and flagged; a node without a fallback
//! aborts the run. In-flight nodes are always awaited, even on abort.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::CollaboratorError;
use crate::events::{SharedEventBus, WorkflowEvent};
use crate::graph::WorkflowGraph;
use crate::registry::{NodeContext, NodeKind, NodeOutput, SharedNode};
use crate::state::{RunFlag, Slot, StateError, StateSchema, StateStore, WorkflowState};

/// Fatal run errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Node '{node}' ({kind}) failed: {source}")]
    NodeFailed {
        node: String,
        kind: NodeKind,
        source: CollaboratorError,
    },

    #[error("Node '{node}' wrote undeclared slot '{slot}'")]
    UndeclaredWrite { node: String, slot: Slot },

    #[error("Detective '{node}' wrote evidence under foreign key '{key}'")]
    ForeignEvidenceKey { node: String, key: String },

    #[error("Router '{0}' returned no route")]
    MissingRoute(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Step budget of {0} node executions exhausted")]
    StepBudgetExhausted(usize),

    #[error("Worker task failed: {0}")]
    JoinFailed(String),
}

/// Scheduler limits
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timeout for one node invocation
    pub node_timeout: Duration,
    /// Maximum nodes executing at once
    pub max_parallel: usize,
    /// Maximum node executions per run
    pub max_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            node_timeout: Duration::from_secs(config.node_timeout_secs.max(1)),
            max_parallel: config.max_parallel_workers.max(1),
            max_steps: config.max_steps.max(1),
        }
    }
}

/// Terminal result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: WorkflowState,
    /// Total node executions
    pub steps: usize,
    /// Executions per node id
    pub executions: BTreeMap<String, usize>,
}

impl RunOutcome {
    pub fn executions_of(&self, node: &str) -> usize {
        self.executions.get(node).copied().unwrap_or(0)
    }
}

/// Executes a validated workflow graph
pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    schema: StateSchema,
    config: SchedulerConfig,
    events: Option<SharedEventBus>,
}

impl Scheduler {
    pub fn new(graph: WorkflowGraph, schema: StateSchema) -> Self {
        Self {
            graph: Arc::new(graph),
            schema,
            config: SchedulerConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run the graph to its terminal state
    pub async fn run(&self, initial: WorkflowState) -> Result<RunOutcome, SchedulerError> {
        let store = StateStore::new(initial, self.schema.clone())?;
        let run_id = store.state().run_id().unwrap_or_default().to_string();

        info!(
            run_id = %run_id,
            nodes = self.graph.len(),
            max_parallel = self.config.max_parallel,
            "Workflow run started"
        );
        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            nodes: self.graph.len(),
            timestamp: Utc::now(),
        });

        let mut run = RunLoop::new(self, store);
        if let Err(e) = run.drive().await {
            warn!(run_id = %run_id, error = %e, "Workflow run aborted");
            run.settle().await;
            return Err(e);
        }

        let steps = run.steps;
        let executions = run.executions;
        let state = run.store.into_state();

        info!(
            run_id = %run_id,
            steps,
            iterations = state.iteration_count,
            score = state.aggregated_score,
            verdict = %state.verdict,
            "Workflow run completed"
        );
        self.publish(WorkflowEvent::RunCompleted {
            run_id,
            verdict: state.verdict,
            score: state.aggregated_score,
            steps,
            timestamp: Utc::now(),
        });

        Ok(RunOutcome {
            state,
            steps,
            executions,
        })
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Result of one node task
struct Completion {
    id: String,
    node: SharedNode,
    ctx: NodeContext,
    result: Result<NodeOutput, CollaboratorError>,
    elapsed: Duration,
}

/// Mutable bookkeeping for a single run
struct RunLoop<'a> {
    scheduler: &'a Scheduler,
    store: StateStore,
    ready: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    /// Static predecessors that have fired, per waiting node
    fired: BTreeMap<String, BTreeSet<String>>,
    join_set: JoinSet<Completion>,
    semaphore: Arc<Semaphore>,
    steps: usize,
    executions: BTreeMap<String, usize>,
}

impl<'a> RunLoop<'a> {
    fn new(scheduler: &'a Scheduler, store: StateStore) -> Self {
        let mut run = Self {
            scheduler,
            store,
            ready: VecDeque::new(),
            queued: HashSet::new(),
            running: HashSet::new(),
            fired: BTreeMap::new(),
            join_set: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(scheduler.config.max_parallel)),
            steps: 0,
            executions: BTreeMap::new(),
        };
        for entry in scheduler.graph.entries() {
            run.enqueue(entry);
        }
        run
    }

    async fn drive(&mut self) -> Result<(), SchedulerError> {
        loop {
            while let Some(id) = self.ready.pop_front() {
                self.queued.remove(&id);
                self.spawn(id)?;
            }

            let Some(joined) = self.join_set.join_next().await else {
                return Ok(());
            };
            let completion = joined.map_err(|e| SchedulerError::JoinFailed(e.to_string()))?;
            self.running.remove(&completion.id);
            self.complete(completion)?;
        }
    }

    /// Await every in-flight node, discarding results
    async fn settle(&mut self) {
        while let Some(joined) = self.join_set.join_next().await {
            if let Ok(completion) = joined {
                debug!(node = %completion.id, "In-flight node settled after abort");
            }
        }
    }

    fn enqueue(&mut self, id: &str) {
        if self.running.contains(id) || self.queued.contains(id) {
            debug!(node = id, "Node already scheduled, trigger skipped");
            return;
        }
        self.queued.insert(id.to_string());
        self.ready.push_back(id.to_string());
    }

    fn spawn(&mut self, id: String) -> Result<(), SchedulerError> {
        let max_steps = self.scheduler.config.max_steps;
        if self.steps >= max_steps {
            return Err(SchedulerError::StepBudgetExhausted(max_steps));
        }
        let node = self
            .scheduler
            .graph
            .node(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownNode(id.clone()))?;

        self.steps += 1;
        *self.executions.entry(id.clone()).or_default() += 1;
        self.running.insert(id.clone());

        let ctx = NodeContext::new(self.store.snapshot());
        debug!(node = %id, kind = %node.kind(), iteration = ctx.iteration, "Node dispatched");
        self.scheduler.publish(WorkflowEvent::NodeStarted {
            node: id.clone(),
            kind: node.kind(),
            iteration: ctx.iteration,
            timestamp: Utc::now(),
        });

        let semaphore = Arc::clone(&self.semaphore);
        let timeout = self.scheduler.config.node_timeout;
        self.join_set.spawn(async move {
            // Never closed; a missing permit only loses the concurrency bound
            let _permit = semaphore.acquire().await.ok();
            let started = Instant::now();

            let invocation = AssertUnwindSafe(node.run(ctx.clone())).catch_unwind();
            let result = match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(CollaboratorError::panicked(panic_message(&*panic))),
                Err(_) => Err(CollaboratorError::timeout(format!(
                    "node exceeded {:.1}s timeout",
                    timeout.as_secs_f64()
                ))),
            };

            Completion {
                id,
                node,
                ctx,
                result,
                elapsed: started.elapsed(),
            }
        });
        Ok(())
    }

    fn complete(&mut self, completion: Completion) -> Result<(), SchedulerError> {
        let Completion {
            id,
            node,
            ctx,
            result,
            elapsed,
        } = completion;
        let kind = node.kind();
        let elapsed_ms = elapsed.as_millis() as u64;

        let output = match result {
            Ok(output) => {
                info!(node = %id, %kind, iteration = ctx.iteration, elapsed_ms, "Node completed");
                self.scheduler.publish(WorkflowEvent::NodeCompleted {
                    node: id.clone(),
                    kind,
                    iteration: ctx.iteration,
                    elapsed_ms,
                    timestamp: Utc::now(),
                });
                self.check_patch(&id, &node, &output.patch)?;
                output
            }
            Err(failure) => {
                warn!(
                    node = %id,
                    %kind,
                    iteration = ctx.iteration,
                    failure = %failure.kind,
                    error = %failure.message,
                    "Node failed"
                );
                self.scheduler.publish(WorkflowEvent::NodeFailed {
                    node: id.clone(),
                    kind,
                    iteration: ctx.iteration,
                    failure: failure.kind.to_string(),
                    message: failure.message.clone(),
                    timestamp: Utc::now(),
                });

                let Some(patch) = node.fallback(&ctx, &failure) else {
                    return Err(SchedulerError::NodeFailed {
                        node: id,
                        kind,
                        source: failure,
                    });
                };
                let flag = RunFlag::new(
                    failure.flag_kind(),
                    id.clone(),
                    ctx.iteration,
                    failure.to_string(),
                );
                self.check_patch(&id, &node, &patch)?;
                NodeOutput::patch(patch.with_flag(flag))
            }
        };

        let slots = output.patch.written_slots();
        self.store.apply(output.patch)?;
        self.scheduler.publish(WorkflowEvent::PatchMerged {
            node: id.clone(),
            slots,
            merges: self.store.merges(),
            timestamp: Utc::now(),
        });

        if kind == NodeKind::Router {
            let route = output
                .route
                .ok_or_else(|| SchedulerError::MissingRoute(id.clone()))?;
            let iteration = self.store.state().iteration_count;
            info!(node = %id, %route, iteration, "Route chosen");
            self.scheduler.publish(WorkflowEvent::GateDecision {
                node: id.clone(),
                route,
                iteration,
                timestamp: Utc::now(),
            });

            let graph = Arc::clone(&self.scheduler.graph);
            let targets = graph
                .route_targets(&id, route)
                .ok_or_else(|| SchedulerError::MissingRoute(id.clone()))?;
            for target in targets {
                self.enqueue(target);
            }
            return Ok(());
        }

        if output.route.is_some() {
            warn!(node = %id, %kind, "Route returned by a non-router node ignored");
        }

        let graph = Arc::clone(&self.scheduler.graph);
        for successor in graph.successors(&id) {
            let fired = self.fired.entry(successor.clone()).or_default();
            fired.insert(id.clone());
            let barrier_met = graph
                .predecessors(successor)
                .map_or(true, |preds| preds.is_subset(fired));
            if barrier_met {
                self.fired.remove(successor);
                debug!(node = %successor, "Join barrier released");
                self.enqueue(successor);
            } else {
                debug!(
                    node = %successor,
                    fired = fired.len(),
                    "Waiting on remaining predecessors"
                );
            }
        }
        Ok(())
    }

    /// A patch may only write declared slots; detectives only under their own id
    fn check_patch(
        &self,
        id: &str,
        node: &SharedNode,
        patch: &crate::state::StatePatch,
    ) -> Result<(), SchedulerError> {
        for slot in patch.written_slots() {
            if !node.writes().contains(&slot) {
                return Err(SchedulerError::UndeclaredWrite {
                    node: id.to_string(),
                    slot,
                });
            }
        }
        if node.kind() == NodeKind::Detective {
            if let Some(key) = patch.evidence_agents().find(|key| *key != id) {
                return Err(SchedulerError::ForeignEvidenceKey {
                    node: id.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("node panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("node panicked: {}", s)
    } else {
        "node panicked".to_string()
    }
}
