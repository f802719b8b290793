//! JSON presentation of a finished audit

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tribunal::{EvidenceStatus, Presenter, RunFlag, Verdict, WorkflowState};

/// Headline figures, ahead of the full state
#[derive(Debug, Serialize)]
pub struct ReportSummary<'a> {
    pub run_id: Option<&'a str>,
    pub verdict: Verdict,
    pub score: f64,
    pub evidence_status: EvidenceStatus,
    pub retries: u32,
    pub flags: &'a [RunFlag],
}

#[derive(Debug, Serialize)]
pub struct AuditReport<'a> {
    pub reported_at: DateTime<Utc>,
    pub summary: ReportSummary<'a>,
    pub state: &'a WorkflowState,
}

impl<'a> AuditReport<'a> {
    pub fn new(state: &'a WorkflowState) -> Self {
        Self {
            reported_at: Utc::now(),
            summary: ReportSummary {
                run_id: state.run_id(),
                verdict: state.verdict,
                score: state.aggregated_score,
                evidence_status: state.evidence_status,
                retries: state.iteration_count,
                flags: &state.flags,
            },
            state,
        }
    }
}

/// Where the report goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportTarget {
    Stdout,
    File(PathBuf),
}

/// Pretty-printed JSON report
pub struct JsonPresenter {
    target: ReportTarget,
}

impl JsonPresenter {
    pub fn new(target: ReportTarget) -> Self {
        Self { target }
    }

    pub fn stdout() -> Self {
        Self::new(ReportTarget::Stdout)
    }

    pub fn render(state: &WorkflowState) -> Result<String> {
        serde_json::to_string_pretty(&AuditReport::new(state)).context("Failed to serialize report")
    }
}

impl Presenter for JsonPresenter {
    fn present(&self, state: &WorkflowState) -> Result<()> {
        let rendered = Self::render(state)?;
        match &self.target {
            ReportTarget::Stdout => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{rendered}").context("Failed to write report to stdout")?;
            }
            ReportTarget::File(path) => {
                std::fs::write(path, format!("{rendered}\n"))
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
            }
        }
        Ok(())
    }
}
