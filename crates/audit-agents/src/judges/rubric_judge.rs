//! Deterministic offline judge
//!
//! Scores come from the share of found evidence, read through each persona:
//! the prosecutor squares it, the defense takes the square root with a floor
//! once anything is found, the tech lead weighs by confidence.

use async_trait::async_trait;
use tribunal::state::Metadata;
use tribunal::{CollaboratorError, EvidenceRecord, JudgeId, JudgmentCollaborator, RawOpinion, ScoreRange};

/// Defense ratio floor once any evidence is found.
const DEFENSE_FLOOR: f64 = 0.5;

pub struct RubricJudge {
    range: ScoreRange,
}

impl RubricJudge {
    pub fn new(range: ScoreRange) -> Self {
        Self { range }
    }

    /// Persona reading of the evidence as a ratio in [0, 1]
    pub fn ratio(judge: JudgeId, evidence: &[EvidenceRecord]) -> f64 {
        if evidence.is_empty() {
            return 0.0;
        }
        let found = evidence.iter().filter(|e| e.found()).count();
        let share = found as f64 / evidence.len() as f64;

        match judge {
            JudgeId::Prosecutor => share * share,
            JudgeId::Defense if found > 0 => share.sqrt().max(DEFENSE_FLOOR),
            JudgeId::Defense => 0.0,
            JudgeId::TechLead => {
                let total: f64 = evidence.iter().map(|e| e.confidence()).sum();
                if total <= 0.0 {
                    return share;
                }
                let weighted: f64 = evidence
                    .iter()
                    .filter(|e| e.found())
                    .map(|e| e.confidence())
                    .sum();
                weighted / total
            }
        }
    }

    pub fn score(&self, judge: JudgeId, evidence: &[EvidenceRecord]) -> f64 {
        let scaled = self.range.scale(Self::ratio(judge, evidence));
        ((scaled * 100.0).round() / 100.0).clamp(self.range.min, self.range.max)
    }
}

#[async_trait]
impl JudgmentCollaborator for RubricJudge {
    async fn deliberate(
        &self,
        judge: JudgeId,
        evidence: &[EvidenceRecord],
        metadata: &Metadata,
    ) -> Result<RawOpinion, CollaboratorError> {
        let score = self.score(judge, evidence);
        let (found, missing): (Vec<&EvidenceRecord>, Vec<&EvidenceRecord>) =
            evidence.iter().partition(|e| e.found());
        let insufficient = metadata
            .get("evidence_status")
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == "insufficient");

        let (stance, cited): (String, Vec<&EvidenceRecord>) = match judge {
            JudgeId::Prosecutor => (
                format!("{} of {} requirements unproven", missing.len(), evidence.len()),
                missing.clone(),
            ),
            JudgeId::Defense => (
                format!("{} of {} requirements show real progress", found.len(), evidence.len()),
                found.clone(),
            ),
            JudgeId::TechLead => (
                "weighted by detective confidence".to_string(),
                evidence.iter().collect(),
            ),
        };

        let mut rationale = format!("{}: {} ({:.2}).", judge, stance, score);
        if insufficient {
            rationale.push_str(" Evidence gathering hit the retry ceiling.");
        }

        Ok(RawOpinion {
            judge: judge.as_str().to_string(),
            score,
            rationale,
            cited_evidence: cited.iter().map(|e| e.goal().to_string()).collect(),
        })
    }
}
