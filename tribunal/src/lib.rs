//! Tribunal: workflow engine for repository audits
//!
//! This library provides:
//! - A typed workflow state with per-slot merge reducers
//! - A node registry and a validated static workflow graph
//! - A scheduler running fan-out/fan-in stages on a bounded worker pool
//! - A quality gate with a bounded retry loop
//! - Deterministic evidence aggregation and opinion synthesis
//!
//! # Flow
//!
//! ```text
//! entry → detectives (parallel) → aggregator (join) → quality gate
//!           ↑                                            │
//!           └──────────────── retry ─────────────────────┤
//!                                                        │ proceed
//!                              judges (parallel) ←───────┘
//!                                   │
//!                              synthesizer (join) → terminal state
//! ```
//!
//! Domain work lives behind the collaborator traits in [`collaborators`];
//! this crate holds no I/O of its own.

#![allow(clippy::uninlined_format_args)]

pub mod aggregator;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod graph;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod synthesizer;

pub use aggregator::{AggregatorNode, EvidenceAggregator};
pub use collaborators::{
    validate_opinion, DetectiveNode, DocumentCollaborator, JudgeNode, JudgmentCollaborator,
    Presenter, RawOpinion, SourceTreeCollaborator,
};
pub use config::{ConfigError, EngineConfig};
pub use error::{CollaboratorError, FailureKind};
pub use events::{EventBus, EventFilter, SharedEventBus, WorkflowEvent, EVENT_TYPES};
pub use gate::{GateDecision, QualityGate, QualityGateNode};
pub use graph::{GraphBuilder, GraphError, WorkflowGraph};
pub use registry::{Node, NodeContext, NodeKind, NodeOutput, NodeRegistry, Route, SharedNode};
pub use scheduler::{RunOutcome, Scheduler, SchedulerConfig, SchedulerError};
pub use state::{
    DocumentRef, EvidenceRecord, EvidenceStatus, FlagKind, JudgeId, OpinionRecord, RunFlag,
    ScoreRange, Slot, StatePatch, StateSchema, StateStore, Verdict, WorkflowState,
};
pub use synthesizer::{OpinionSynthesizer, SynthesisConfig, SynthesizerNode, VerdictLadder};
