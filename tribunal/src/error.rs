//! Collaborator failure taxonomy.
//!
//! Collaborator failures are never fatal to a run. Each one is classified so
//! node adapters can turn it into the right substitute record and flag
//! without string matching.
//!
//! | Kind        | Trigger                                   | Flag                     |
//! |-------------|-------------------------------------------|--------------------------|
//! | Unavailable | workspace/document missing, I/O, network  | collaborator_unavailable |
//! | Timeout     | node exceeded its per-node timeout        | collaborator_timeout     |
//! | Malformed   | judgment out of range, unknown judge      | malformed_judgment       |
//! | Panicked    | node task panicked                        | collaborator_unavailable |

use std::fmt;

use thiserror::Error;

use crate::state::FlagKind;

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Input missing or unreadable, backend unreachable.
    Unavailable,
    /// The node exceeded its per-node timeout.
    Timeout,
    /// Output could not be validated at the boundary.
    Malformed,
    /// The node task panicked.
    Panicked,
}

impl FailureKind {
    /// Flag recorded in the run report for this failure.
    pub fn flag_kind(self) -> FlagKind {
        match self {
            Self::Unavailable | Self::Panicked => FlagKind::CollaboratorUnavailable,
            Self::Timeout => FlagKind::CollaboratorTimeout,
            Self::Malformed => FlagKind::MalformedJudgment,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Malformed => write!(f, "malformed"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

/// Non-fatal failure reported by a collaborator or node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CollaboratorError {
    pub kind: FailureKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Malformed, message)
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Panicked, message)
    }

    pub fn flag_kind(&self) -> FlagKind {
        self.kind.flag_kind()
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

impl From<crate::state::RecordError> for CollaboratorError {
    fn from(err: crate::state::RecordError) -> Self {
        Self::malformed(err.to_string())
    }
}
