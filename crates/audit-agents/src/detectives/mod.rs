//! Reference detectives
//!
//! - [`SourceTreeDetective`]: rubric regexes over the workspace files
//! - [`DocumentDetective`]: rubric keyword claims in the report
//! - [`HistoryDetective`]: commit history depth

pub mod document;
pub mod history;
pub mod source_tree;

pub use document::DocumentDetective;
pub use history::HistoryDetective;
pub use source_tree::SourceTreeDetective;
