//! History detective: commit count from `git log`

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;
use tribunal::{CollaboratorError, EvidenceRecord, SourceTreeCollaborator};

use crate::rubric::HistoryRequirement;

pub const FOUND_CONFIDENCE: f64 = 0.9;
pub const MISSING_CONFIDENCE: f64 = 0.7;
/// Confidence that history is absent when `git log` cannot read the workspace
pub const NO_HISTORY_CONFIDENCE: f64 = 0.8;
/// Commits quoted at each end of the log.
const QUOTED_COMMITS: usize = 5;

pub struct HistoryDetective {
    requirement: HistoryRequirement,
}

impl HistoryDetective {
    pub fn new(requirement: HistoryRequirement) -> Self {
        Self { requirement }
    }

    /// Judge a `git log --oneline --reverse` listing
    pub fn assess(&self, log: &str, location: &str) -> Result<EvidenceRecord, CollaboratorError> {
        let commits: Vec<&str> = log.lines().filter(|l| !l.trim().is_empty()).collect();
        let min = self.requirement.min_commits;
        let found = commits.len() >= min;

        let record = EvidenceRecord::new(self.requirement.goal.as_str(), found, location)?
            .with_confidence(if found {
                FOUND_CONFIDENCE
            } else {
                MISSING_CONFIDENCE
            })
            .with_rationale(format!(
                "{} commit(s) in history, {} required",
                commits.len(),
                min
            ))
            .with_content(excerpt(&commits));
        Ok(record)
    }

    /// Record for a workspace `git log` could not read
    pub fn unreadable(&self, reason: &str, location: &str) -> Result<EvidenceRecord, CollaboratorError> {
        Ok(EvidenceRecord::new(self.requirement.goal.as_str(), false, location)?
            .with_confidence(NO_HISTORY_CONFIDENCE)
            .with_rationale(format!("no readable git history: {}", reason.trim())))
    }
}

#[async_trait]
impl SourceTreeCollaborator for HistoryDetective {
    async fn investigate(&self, workspace: &Path) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
        let location = workspace.display().to_string();
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(workspace)
            .args(["log", "--oneline", "--reverse"])
            .output()
            .await
            .map_err(|e| CollaboratorError::unavailable(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(workspace = %location, "git log failed: {}", stderr.trim());
            return Ok(vec![self.unreadable(&stderr, &location)?]);
        }

        let log = String::from_utf8_lossy(&output.stdout);
        Ok(vec![self.assess(&log, &location)?])
    }
}

fn excerpt(commits: &[&str]) -> String {
    if commits.len() <= QUOTED_COMMITS * 2 {
        return commits.join("\n");
    }
    let head = &commits[..QUOTED_COMMITS];
    let tail = &commits[commits.len() - QUOTED_COMMITS..];
    format!(
        "{}\n... {} more ...\n{}",
        head.join("\n"),
        commits.len() - QUOTED_COMMITS * 2,
        tail.join("\n")
    )
}
