//! Judgment collaborators
//!
//! [`RubricJudge`] scores offline and deterministically; [`HttpJudge`] asks an
//! OpenAI-compatible model in the judge's persona.

pub mod http;
pub mod rubric_judge;

pub use http::HttpJudge;
pub use rubric_judge::RubricJudge;
