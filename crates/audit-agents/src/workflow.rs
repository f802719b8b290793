//! Default audit graph and its collaborators
//!
//! ```text
//! source_tree ┐                                   ┌ prosecutor ┐
//! document    ├→ aggregator → quality_gate ─proceed┼ defense    ├→ chief_justice
//! history     ┘                  │ retry          └ tech_lead  ┘
//!     ↑──────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tribunal::{
    AggregatorNode, DetectiveNode, DocumentCollaborator, DocumentRef, GraphBuilder, JudgeId,
    JudgeNode, JudgmentCollaborator, OpinionSynthesizer, QualityGateNode, RunOutcome, Scheduler,
    SchedulerConfig, SharedEventBus, SourceTreeCollaborator, StateSchema, WorkflowGraph,
    WorkflowState, SynthesizerNode,
};

use crate::config::{AuditConfig, JudgeBackend};
use crate::detectives::{DocumentDetective, HistoryDetective, SourceTreeDetective};
use crate::judges::{HttpJudge, RubricJudge};
use crate::rubric::Rubric;

pub const SOURCE_TREE: &str = "source_tree";
pub const DOCUMENT: &str = "document";
pub const HISTORY: &str = "history";
pub const AGGREGATOR: &str = "aggregator";
pub const QUALITY_GATE: &str = "quality_gate";
pub const CHIEF_JUSTICE: &str = "chief_justice";

pub const DETECTIVES: [&str; 3] = [SOURCE_TREE, DOCUMENT, HISTORY];

/// The domain work behind each node family
#[derive(Clone)]
pub struct Collaborators {
    pub source_tree: Arc<dyn SourceTreeCollaborator>,
    pub document: Arc<dyn DocumentCollaborator>,
    pub history: Arc<dyn SourceTreeCollaborator>,
    /// Shared by all three judges; the judge identity is passed per call
    pub judgment: Arc<dyn JudgmentCollaborator>,
}

impl Collaborators {
    /// Reference collaborators for `rubric`, judge backend per `config`
    pub fn from_config(config: &AuditConfig, rubric: &Rubric) -> Result<Self> {
        let range = config.engine.score_range;
        let judgment: Arc<dyn JudgmentCollaborator> = match config.judge.backend {
            JudgeBackend::Offline => Arc::new(RubricJudge::new(range)),
            JudgeBackend::Http => Arc::new(
                HttpJudge::new(&config.judge, range).context("Failed to build judge HTTP client")?,
            ),
        };

        Ok(Self {
            source_tree: Arc::new(
                SourceTreeDetective::new(rubric).context("Invalid source checks in rubric")?,
            ),
            document: Arc::new(
                DocumentDetective::new(rubric).context("Invalid document claims in rubric")?,
            ),
            history: Arc::new(HistoryDetective::new(rubric.history.clone())),
            judgment,
        })
    }
}

/// Validated audit graph ready to run
pub struct AuditWorkflow {
    scheduler: Scheduler,
    rubric_version: String,
}

impl AuditWorkflow {
    pub fn build(config: &AuditConfig, rubric: &Rubric, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("Invalid audit configuration")?;
        let engine = &config.engine;

        let synthesizer = OpinionSynthesizer::new(engine.synthesis_config())
            .context("Invalid synthesis configuration")?;
        let judge_ids: Vec<&str> = JudgeId::all().iter().map(|j| j.as_str()).collect();

        let mut builder = GraphBuilder::new()
            .node(Arc::new(DetectiveNode::source_tree(
                SOURCE_TREE,
                collaborators.source_tree,
            )))
            .node(Arc::new(DetectiveNode::document(DOCUMENT, collaborators.document)))
            .node(Arc::new(DetectiveNode::source_tree(HISTORY, collaborators.history)))
            .node(Arc::new(AggregatorNode::new(AGGREGATOR, engine.aggregator())))
            .node(Arc::new(QualityGateNode::new(QUALITY_GATE, engine.quality_gate())))
            .node(Arc::new(SynthesizerNode::new(CHIEF_JUSTICE, synthesizer)));
        for judge in JudgeId::all() {
            builder = builder.node(Arc::new(JudgeNode::new(
                judge.as_str(),
                *judge,
                Arc::clone(&collaborators.judgment),
                engine.score_range,
            )));
        }
        for detective in DETECTIVES {
            builder = builder.entry(detective);
        }

        let schema = StateSchema::default();
        let graph = builder
            .join(&DETECTIVES, AGGREGATOR)
            .edge(AGGREGATOR, QUALITY_GATE)
            .route(QUALITY_GATE, &DETECTIVES, &judge_ids)
            .join(&judge_ids, CHIEF_JUSTICE)
            .build(&schema)
            .context("Audit graph failed validation")?;

        info!(
            nodes = graph.len(),
            rubric = %rubric.version,
            max_retries = engine.max_retries,
            "Audit workflow built"
        );

        Ok(Self {
            scheduler: Scheduler::new(graph, schema).with_config(SchedulerConfig::from(engine)),
            rubric_version: rubric.version.clone(),
        })
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.scheduler = self.scheduler.with_events(events);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        self.scheduler.graph()
    }

    pub fn initial_state(&self, workspace: &Path, document: Option<PathBuf>) -> WorkflowState {
        WorkflowState::new(workspace, DocumentRef::from_option(document))
            .with_metadata("rubric_version", serde_json::json!(self.rubric_version))
    }

    /// Audit `workspace`, optionally against a report `document`
    pub async fn run(&self, workspace: &Path, document: Option<PathBuf>) -> Result<RunOutcome> {
        let initial = self.initial_state(workspace, document);
        self.scheduler.run(initial).await.context("Audit run failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribunal::NodeKind;

    #[test]
    fn test_default_graph_shape() {
        let config = AuditConfig::default();
        let rubric = Rubric::default();
        let collaborators = Collaborators::from_config(&config, &rubric).unwrap();
        let workflow = AuditWorkflow::build(&config, &rubric, collaborators).unwrap();
        let graph = workflow.graph();

        assert_eq!(graph.len(), 9);
        assert_eq!(graph.registry().of_kind(NodeKind::Detective).len(), 3);
        assert_eq!(graph.registry().of_kind(NodeKind::Judge).len(), 3);
        assert_eq!(graph.entries().len(), 3);
        assert_eq!(graph.predecessors(AGGREGATOR).map(|p| p.len()), Some(3));
        assert_eq!(graph.predecessors(CHIEF_JUSTICE).map(|p| p.len()), Some(3));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = AuditConfig::default();
        config.engine.max_parallel_workers = 0;
        let rubric = Rubric::default();
        let collaborators = Collaborators::from_config(&AuditConfig::default(), &rubric).unwrap();
        assert!(AuditWorkflow::build(&config, &rubric, collaborators).is_err());
    }

    #[test]
    fn test_initial_state_records_rubric_version() {
        let config = AuditConfig::default();
        let rubric = Rubric {
            version: "custom-7".into(),
            ..Rubric::default()
        };
        let collaborators = Collaborators::from_config(&config, &rubric).unwrap();
        let workflow = AuditWorkflow::build(&config, &rubric, collaborators).unwrap();
        let state = workflow.initial_state(Path::new("/ws"), None);

        assert_eq!(state.metadata["rubric_version"], serde_json::json!("custom-7"));
        assert!(state.run_id().is_some());
        assert_eq!(state.document, DocumentRef::Absent);
    }
}
