//! Opinion synthesis: weighted score, verdict ladder and rationale.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CollaboratorError;
use crate::registry::{Node, NodeContext, NodeKind, NodeOutput};
use crate::state::{JudgeId, OpinionRecord, RecordError, ScoreRange, Slot, StatePatch, Verdict};

/// Score spread at which the rationale notes judicial dissent
pub const DISSENT_SPREAD: f64 = 2.0;

/// Error type for synthesis configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("Weight for {judge} must be finite and non-negative, got {weight}")]
    InvalidWeight { judge: JudgeId, weight: f64 },

    #[error("Verdict ladder thresholds must be strictly descending: {above} then {below}")]
    LadderNotDescending { above: f64, below: f64 },

    #[error("Verdict ladder threshold {threshold} is outside the score range [{min}, {max}]")]
    RungOutOfRange { threshold: f64, min: f64, max: f64 },

    #[error("Verdict 'void' is reserved for runs without opinions")]
    VoidRung,

    #[error(transparent)]
    Range(#[from] RecordError),
}

/// One step of the verdict ladder: scores at or above `threshold` earn `verdict`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerdictRung {
    pub threshold: f64,
    pub verdict: Verdict,
}

/// Ordered thresholds over the score range
///
/// Rungs are checked top-down; a score below every rung gets `floor`, so
/// the ladder always covers the whole range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictLadder {
    pub rungs: Vec<VerdictRung>,
    pub floor: Verdict,
}

impl Default for VerdictLadder {
    fn default() -> Self {
        Self {
            rungs: vec![
                VerdictRung {
                    threshold: 4.5,
                    verdict: Verdict::Elite,
                },
                VerdictRung {
                    threshold: 3.5,
                    verdict: Verdict::Approved,
                },
                VerdictRung {
                    threshold: 2.0,
                    verdict: Verdict::Probation,
                },
            ],
            floor: Verdict::Rejected,
        }
    }
}

impl VerdictLadder {
    pub fn validate(&self, range: &ScoreRange) -> Result<(), SynthesisError> {
        if self.floor == Verdict::Void || self.rungs.iter().any(|r| r.verdict == Verdict::Void) {
            return Err(SynthesisError::VoidRung);
        }
        for rung in &self.rungs {
            if !rung.threshold.is_finite() || rung.threshold > range.max || rung.threshold < range.min {
                return Err(SynthesisError::RungOutOfRange {
                    threshold: rung.threshold,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        for pair in self.rungs.windows(2) {
            if pair[1].threshold >= pair[0].threshold {
                return Err(SynthesisError::LadderNotDescending {
                    above: pair[0].threshold,
                    below: pair[1].threshold,
                });
            }
        }
        Ok(())
    }

    pub fn classify(&self, score: f64) -> Verdict {
        self.rungs
            .iter()
            .find(|rung| score >= rung.threshold)
            .map(|rung| rung.verdict)
            .unwrap_or(self.floor)
    }
}

/// Weights, ladder and range used to synthesize a verdict
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Per-judge weights; `None` means an arithmetic mean
    #[serde(default)]
    pub weights: Option<BTreeMap<JudgeId, f64>>,
    #[serde(default)]
    pub ladder: VerdictLadder,
    #[serde(default)]
    pub range: ScoreRange,
}

impl SynthesisConfig {
    pub fn with_weights(mut self, weights: BTreeMap<JudgeId, f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_ladder(mut self, ladder: VerdictLadder) -> Self {
        self.ladder = ladder;
        self
    }

    pub fn validate(&self) -> Result<(), SynthesisError> {
        self.range.validate()?;
        if let Some(weights) = &self.weights {
            for (judge, weight) in weights {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(SynthesisError::InvalidWeight {
                        judge: *judge,
                        weight: *weight,
                    });
                }
            }
        }
        self.ladder.validate(&self.range)
    }

    /// Weight for a present judge; unlisted judges count 1.0
    fn weight(&self, judge: JudgeId) -> f64 {
        self.weights
            .as_ref()
            .and_then(|w| w.get(&judge).copied())
            .unwrap_or(1.0)
    }
}

/// Final score, verdict and explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub score: f64,
    pub verdict: Verdict,
    pub rationale: String,
    pub dissent: bool,
}

/// Deterministic opinion synthesizer
#[derive(Debug, Clone, Default)]
pub struct OpinionSynthesizer {
    config: SynthesisConfig,
}

impl OpinionSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self, SynthesisError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Weighted score over the judges present, or the mean when no weights
    /// are configured or they sum to zero. `None` when there are no opinions.
    pub fn score(&self, opinions: &[OpinionRecord]) -> Option<f64> {
        if opinions.is_empty() {
            return None;
        }
        let mean = opinions.iter().map(OpinionRecord::score).sum::<f64>() / opinions.len() as f64;
        if self.config.weights.is_none() {
            return Some(mean);
        }

        let total: f64 = opinions.iter().map(|o| self.config.weight(o.judge_id())).sum();
        if total <= 0.0 {
            return Some(mean);
        }
        let weighted: f64 = opinions
            .iter()
            .map(|o| o.score() * self.config.weight(o.judge_id()))
            .sum();
        Some(weighted / total)
    }

    pub fn synthesize(&self, opinions: &[OpinionRecord], insufficient: bool) -> Synthesis {
        let Some(score) = self.score(opinions) else {
            let mut rationale = String::from("No judicial opinions were available; verdict is void.");
            if insufficient {
                rationale.push_str(" Evidence was insufficient.");
            }
            return Synthesis {
                score: 0.0,
                verdict: Verdict::Void,
                rationale,
                dissent: false,
            };
        };

        let verdict = self.config.ladder.classify(score);
        let mut rationale = format!(
            "Final score {:.2} ({}) from {} opinion(s).",
            score,
            verdict,
            opinions.len()
        );

        for opinion in opinions {
            let _ = write!(
                rationale,
                "\n- {}: {:.2} (weight {:.2})",
                opinion.judge_id(),
                opinion.score(),
                self.config.weight(opinion.judge_id())
            );
            if !opinion.rationale().is_empty() {
                let _ = write!(rationale, ": {}", opinion.rationale());
            }
        }

        let abstained: Vec<String> = opinions
            .iter()
            .filter(|o| o.is_abstained())
            .map(|o| o.judge_id().to_string())
            .collect();
        if !abstained.is_empty() {
            let _ = write!(
                rationale,
                "\nAbstained at minimum score: {}.",
                abstained.join(", ")
            );
        }

        let dissent = match spread(opinions) {
            Some((low, high)) if high.score() - low.score() >= DISSENT_SPREAD => {
                let _ = write!(
                    rationale,
                    "\nDissent: scores range from {:.2} ({}) to {:.2} ({}).",
                    low.score(),
                    low.judge_id(),
                    high.score(),
                    high.judge_id()
                );
                true
            }
            _ => false,
        };

        if insufficient {
            rationale.push_str(
                "\nEvidence insufficient: the retry ceiling was reached without any positive finding.",
            );
        }

        Synthesis {
            score,
            verdict,
            rationale,
            dissent,
        }
    }
}

/// Lowest and highest scoring opinions
fn spread(opinions: &[OpinionRecord]) -> Option<(&OpinionRecord, &OpinionRecord)> {
    let low = opinions
        .iter()
        .min_by(|a, b| a.score().total_cmp(&b.score()))?;
    let high = opinions
        .iter()
        .max_by(|a, b| a.score().total_cmp(&b.score()))?;
    Some((low, high))
}

/// Synthesizer node: recomputes score and verdict from the opinion list
pub struct SynthesizerNode {
    id: String,
    synthesizer: OpinionSynthesizer,
}

impl SynthesizerNode {
    pub fn new(id: impl Into<String>, synthesizer: OpinionSynthesizer) -> Self {
        Self {
            id: id.into(),
            synthesizer,
        }
    }
}

#[async_trait]
impl Node for SynthesizerNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Synthesizer
    }

    fn writes(&self) -> &[Slot] {
        &[
            Slot::AggregatedScore,
            Slot::Verdict,
            Slot::Rationale,
            Slot::Metadata,
        ]
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, CollaboratorError> {
        let state = ctx.state();
        let synthesis = self
            .synthesizer
            .synthesize(&state.opinions, state.evidence_insufficient());

        info!(
            node = %self.id,
            opinions = state.opinions.len(),
            score = synthesis.score,
            verdict = %synthesis.verdict,
            dissent = synthesis.dissent,
            "Verdict synthesized"
        );

        let patch = StatePatch::new()
            .with_aggregated_score(synthesis.score)
            .with_verdict(synthesis.verdict)
            .with_rationale(synthesis.rationale)
            .with_metadata("opinion_count", serde_json::json!(state.opinions.len()))
            .with_metadata("dissent", serde_json::json!(synthesis.dissent));
        Ok(NodeOutput::patch(patch))
    }
}
