//! Document detective: keyword claims in the submitted report

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use tribunal::{CollaboratorError, DocumentCollaborator, DocumentRef, EvidenceRecord};

use crate::rubric::{DocumentClaim, Rubric, RubricError};

/// Context kept before a keyword match, in chars.
const CONTEXT_BEFORE: usize = 100;
/// Context kept after a keyword match, in chars.
const CONTEXT_AFTER: usize = 300;

pub const FOUND_CONFIDENCE: f64 = 0.9;
pub const MISSING_CONFIDENCE: f64 = 0.2;

pub struct DocumentDetective {
    claims: Vec<(DocumentClaim, Regex)>,
}

impl DocumentDetective {
    pub fn new(rubric: &Rubric) -> Result<Self, RubricError> {
        let claims = rubric
            .document_claims
            .iter()
            .map(|claim| Ok((claim.clone(), claim.compile()?)))
            .collect::<Result<Vec<_>, RubricError>>()?;
        Ok(Self { claims })
    }

    /// One record per claim, in rubric order
    pub fn examine(&self, text: &str, location: &str) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
        let mut records = Vec::with_capacity(self.claims.len());
        for (claim, regex) in &self.claims {
            let record = match regex.find(text) {
                Some(m) => EvidenceRecord::new(claim.goal.as_str(), true, location)?
                    .with_confidence(FOUND_CONFIDENCE)
                    .with_rationale(format!("report mentions \"{}\"", m.as_str()))
                    .with_content(context_window(text, m.start(), m.end())),
                None => EvidenceRecord::new(claim.goal.as_str(), false, location)?
                    .with_confidence(MISSING_CONFIDENCE)
                    .with_rationale(format!(
                        "report never mentions any of: {}",
                        claim.keywords.join(", ")
                    )),
            };
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl DocumentCollaborator for DocumentDetective {
    async fn analyse(&self, document: &DocumentRef) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
        let path = match document {
            DocumentRef::Absent => {
                return Ok(vec![EvidenceRecord::unavailable(
                    "document availability",
                    "no document",
                    "no report document was submitted",
                )])
            }
            DocumentRef::Path(path) => path,
        };

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            CollaboratorError::unavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let text = String::from_utf8_lossy(&bytes);
        debug!(path = %path.display(), bytes = bytes.len(), "Report document loaded");

        self.examine(&text, &path.display().to_string())
    }
}

/// Text around the match at byte range `[start, end)`, counted in chars
fn context_window(text: &str, start: usize, end: usize) -> &str {
    let from = text[..start]
        .char_indices()
        .rev()
        .nth(CONTEXT_BEFORE.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    let to = text[end..]
        .char_indices()
        .nth(CONTEXT_AFTER)
        .map_or(text.len(), |(i, _)| end + i);
    text[from..to].trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detective() -> DocumentDetective {
        DocumentDetective::new(&Rubric::default()).unwrap()
    }

    #[test]
    fn test_claims_matched_case_insensitively() {
        let text = "Our design uses FAN-OUT of detectives and a dialectical bench.";
        let records = detective().examine(text, "report.md").unwrap();

        assert_eq!(records.len(), 3);
        assert!(records[0].found());
        assert_eq!(records[0].confidence(), FOUND_CONFIDENCE);
        assert!(records[1].found());
        assert!(!records[2].found());
        assert_eq!(records[2].confidence(), MISSING_CONFIDENCE);
        assert!(records.iter().all(|r| r.location() == "report.md"));
    }

    #[test]
    fn test_context_window_is_bounded() {
        let text = format!("{}metacognition{}", "a".repeat(500), "b".repeat(500));
        let records = detective().examine(&text, "r").unwrap();
        let content = records[2].content().unwrap();
        assert!(content.contains("metacognition"));
        assert_eq!(content.len(), CONTEXT_BEFORE + "metacognition".len() + CONTEXT_AFTER);
    }

    #[test]
    fn test_context_window_counts_chars() {
        // Multi-byte characters on both sides of the cut points
        let text = format!("{}metacognition{}", "é".repeat(120), "ü".repeat(400));
        let records = detective().examine(&text, "r").unwrap();
        let content = records[2].content().unwrap();
        assert!(content.contains("metacognition"));
        assert_eq!(
            content.chars().count(),
            CONTEXT_BEFORE + "metacognition".len() + CONTEXT_AFTER
        );
        assert!(content.starts_with('é'));
        assert!(content.ends_with('ü'));
    }

    #[test]
    fn test_context_window_near_text_edges() {
        let text = "é metacognition ü";
        let records = detective().examine(text, "r").unwrap();
        assert_eq!(records[2].content(), Some(text));
    }

    #[tokio::test]
    async fn test_absent_document_yields_unavailable_record() {
        let records = detective().analyse(&DocumentRef::Absent).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].found());
        assert_eq!(records[0].confidence(), 1.0);
    }

    #[tokio::test]
    async fn test_unreadable_document_is_unavailable() {
        let err = detective()
            .analyse(&DocumentRef::Path("/no/such/report.md".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, tribunal::FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_reads_document_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        std::fs::write(&path, "# Report\n\nWe practise metacognition.\n").unwrap();

        let records = detective().analyse(&DocumentRef::Path(path)).await.unwrap();
        assert!(records[2].found());
        assert!(!records[0].found());
    }
}
