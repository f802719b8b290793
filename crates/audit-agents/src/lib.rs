//! Audit agents: reference collaborators and wiring for the tribunal engine
//!
//! - `detectives`: source tree, report document and git history
//! - `judges`: offline rubric judge and HTTP model judge
//! - `workflow`: the default audit graph
//! - `config` / `rubric`: TOML/env configuration and JSON rubrics
//! - `report`: JSON presenter

pub mod config;
pub mod detectives;
pub mod judges;
pub mod report;
pub mod rubric;
pub mod workflow;

pub use config::{AuditConfig, JudgeBackend, JudgeConfig};
pub use report::{JsonPresenter, ReportTarget};
pub use rubric::Rubric;
pub use workflow::{AuditWorkflow, Collaborators};
