//! Source-tree detective: regex checks over a .gitignore-aware walk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use tracing::debug;
use tribunal::{CollaboratorError, EvidenceRecord, SourceTreeCollaborator};

use crate::rubric::{Rubric, RubricError, SourceCheck};

/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 1024 * 1024;
/// Longest snippet kept from a matching line.
const MAX_SNIPPET_CHARS: usize = 200;

pub const FOUND_CONFIDENCE: f64 = 0.9;
pub const MISSING_CONFIDENCE: f64 = 0.5;

struct CompiledCheck {
    check: SourceCheck,
    regex: Regex,
}

struct Hit {
    location: String,
    snippet: String,
}

pub struct SourceTreeDetective {
    checks: Arc<Vec<CompiledCheck>>,
}

impl SourceTreeDetective {
    pub fn new(rubric: &Rubric) -> Result<Self, RubricError> {
        let checks = rubric
            .source_checks
            .iter()
            .map(|check| {
                Ok(CompiledCheck {
                    regex: check.compile()?,
                    check: check.clone(),
                })
            })
            .collect::<Result<Vec<_>, RubricError>>()?;
        Ok(Self {
            checks: Arc::new(checks),
        })
    }
}

#[async_trait]
impl SourceTreeCollaborator for SourceTreeDetective {
    async fn investigate(&self, workspace: &Path) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
        let root = workspace.to_path_buf();
        let checks = Arc::clone(&self.checks);
        tokio::task::spawn_blocking(move || scan(&root, &checks))
            .await
            .map_err(|e| CollaboratorError::unavailable(format!("scan task failed: {e}")))?
    }
}

fn scan(root: &Path, checks: &[CompiledCheck]) -> Result<Vec<EvidenceRecord>, CollaboratorError> {
    if !root.is_dir() {
        return Err(CollaboratorError::unavailable(format!(
            "workspace {} is not a directory",
            root.display()
        )));
    }

    let files = walk(root);
    debug!(root = %root.display(), files = files.len(), "Source tree walked");

    let mut hits: Vec<Option<Hit>> = checks.iter().map(|_| None).collect();
    for path in &files {
        if hits.iter().all(Option::is_some) {
            break;
        }
        let pending: Vec<usize> = (0..checks.len())
            .filter(|&i| hits[i].is_none() && checks[i].check.applies_to(path))
            .collect();
        if pending.is_empty() {
            continue;
        }
        // Binary or unreadable files are skipped
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        let relative = path.strip_prefix(root).unwrap_or(path);
        for i in pending {
            hits[i] = first_match(&checks[i].regex, &text, relative);
        }
    }

    checks
        .iter()
        .zip(hits)
        .map(|(compiled, hit)| -> Result<EvidenceRecord, CollaboratorError> {
            let goal = &compiled.check.goal;
            let record = match hit {
                Some(hit) => EvidenceRecord::new(goal.as_str(), true, hit.location.as_str())?
                    .with_confidence(FOUND_CONFIDENCE)
                    .with_rationale(format!(
                        "pattern `{}` matched at {}",
                        compiled.check.pattern, hit.location
                    ))
                    .with_content(hit.snippet),
                None => EvidenceRecord::new(goal.as_str(), false, root.display().to_string())?
                    .with_confidence(MISSING_CONFIDENCE)
                    .with_rationale(format!(
                        "no file in {} matched pattern `{}`",
                        root.display(),
                        compiled.check.pattern
                    )),
            };
            Ok(record)
        })
        .collect()
}

/// Regular files under `root`, sorted, honouring ignore files
fn walk(root: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build();

    let mut files: Vec<PathBuf> = walker
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter(|entry| {
            entry
                .metadata()
                .map(|m| m.len() <= MAX_FILE_BYTES)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn first_match(regex: &Regex, text: &str, relative: &Path) -> Option<Hit> {
    text.lines().enumerate().find_map(|(index, line)| {
        regex.is_match(line).then(|| Hit {
            location: format!("{}:{}", relative.display(), index + 1),
            snippet: line.trim().chars().take(MAX_SNIPPET_CHARS).collect(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn rubric(checks: Vec<SourceCheck>) -> Rubric {
        Rubric {
            source_checks: checks,
            ..Rubric::default()
        }
    }

    #[tokio::test]
    async fn test_reports_first_match_with_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/graph.py"),
            "import x\n\ngraph = StateGraph(State)\n",
        )
        .unwrap();

        let detective = SourceTreeDetective::new(&rubric(vec![SourceCheck::new(
            "graph",
            "StateGraph",
            &["py"],
        )]))
        .unwrap();
        let records = detective.investigate(dir.path()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].found());
        assert_eq!(records[0].location(), format!("src{}graph.py:3", std::path::MAIN_SEPARATOR));
        assert_eq!(records[0].confidence(), FOUND_CONFIDENCE);
        assert_eq!(records[0].content(), Some("graph = StateGraph(State)"));
    }

    #[tokio::test]
    async fn test_missing_pattern_and_extension_filter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "StateGraph mentioned in prose").unwrap();

        let detective = SourceTreeDetective::new(&rubric(vec![SourceCheck::new(
            "graph",
            "StateGraph",
            &["py"],
        )]))
        .unwrap();
        let records = detective.investigate(dir.path()).await.unwrap();

        assert!(!records[0].found());
        assert_eq!(records[0].confidence(), MISSING_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_gitignored_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "build/\n").unwrap();
        fs::create_dir_all(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/gen.rs"), "let set = JoinSet::new();").unwrap();

        let detective = SourceTreeDetective::new(&rubric(vec![SourceCheck::new(
            "fan-out",
            "JoinSet",
            &[],
        )]))
        .unwrap();
        let records = detective.investigate(dir.path()).await.unwrap();
        assert!(!records[0].found());
    }

    #[tokio::test]
    async fn test_missing_workspace_is_unavailable() {
        let detective = SourceTreeDetective::new(&Rubric::default()).unwrap();
        let err = detective
            .investigate(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, tribunal::FailureKind::Unavailable);
    }
}
