//! Failures a diff request can report to its caller.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter};

/// The stable, machine readable category of a [`DiffError`].
///
/// Callers branch on this to render a specific message;
/// the serialized names are part of the HTTP contract and must not change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumIter, strum::Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The caller supplied a malformed image reference.
    InvalidReference,

    /// The image does not exist locally and could not be found by a pull.
    NotFound,

    /// Pulling the image failed, after retrying transient faults.
    PullFailed,

    /// The image carries no build history to reconstruct a Dockerfile from.
    HistoryUnavailable,

    /// Anything else: the engine misbehaved or is unreachable.
    Internal,
}

/// A failure resolving or reconstructing one image.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum DiffError {
    /// Checked before any engine call; never retried.
    #[display("invalid image reference {input:?}: {message}")]
    InvalidReference { input: String, message: String },

    /// Never retried.
    #[display("image {reference} not found: {message}")]
    NotFound { reference: String, message: String },

    /// Surfaced once the retry budget for transient faults is spent,
    /// or immediately when the engine rejects the pull outright.
    #[display("pull of {reference} failed after {attempts} attempt(s): {message}")]
    PullFailed {
        reference: String,
        attempts: usize,
        message: String,
    },

    #[display("history unavailable for {reference}: {message}")]
    HistoryUnavailable { reference: String, message: String },

    #[display("internal error: {message}")]
    Internal { message: String },
}

impl std::error::Error for DiffError {}

impl DiffError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiffError::InvalidReference { .. } => ErrorKind::InvalidReference,
            DiffError::NotFound { .. } => ErrorKind::NotFound,
            DiffError::PullFailed { .. } => ErrorKind::PullFailed,
            DiffError::HistoryUnavailable { .. } => ErrorKind::HistoryUnavailable,
            DiffError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Create an internal error from anything displayable.
    pub fn internal(message: impl std::fmt::Display) -> Self {
        DiffError::Internal {
            message: message.to_string(),
        }
    }
}

impl From<color_eyre::Report> for DiffError {
    fn from(report: color_eyre::Report) -> Self {
        DiffError::Internal {
            message: format!("{report:#}"),
        }
    }
}
