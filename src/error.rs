//! Error taxonomy shared by every stage.
//!
//! Only conditions that abort something are errors. Rows dropped for a missing
//! key or a failed join lookup are logged as warnings at the point of use and
//! counted in [`StageMetrics`](crate::metrics::StageMetrics); they never reach
//! this type.
//!
//! | Variant | Scope of the failure |
//! |---------|----------------------|
//! | [`StageError::Format`] | the current message (rejected, not requeued) |
//! | [`StageError::ProtocolViolation`] | the whole stage instance |
//! | [`StageError::Transport`] | the current run |
//! | [`StageError::Config`] | topology construction |

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, StageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Malformed envelope, truncated message or wrong declared kind.
    #[error("malformed message: {reason}")]
    Format { reason: String },

    /// A message the stage state machine cannot accept.
    #[error("protocol violation in stage `{stage}`: {reason}")]
    ProtocolViolation { stage: String, reason: String },

    /// The inbound or outbound channel became unusable.
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    /// Invalid topology or configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl StageError {
    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }

    pub fn protocol(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// `true` when the error must tear the stage instance down.
    ///
    /// Format errors only cost the offending message.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Format { .. })
    }
}
