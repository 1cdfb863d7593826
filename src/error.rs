//! Engine Error Types
//!
//! A single error enum covers the four failure families of the engine:
//! graph integrity, token bookkeeping, firing logic and snapshot pairing.

use thiserror::Error;

use crate::execution::engine::EngineStatus;
use crate::execution::token::TokenId;
use crate::workflow::validator::ValidationError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building, running or restoring an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workplan failed integrity validation.
    #[error("workplan '{workplan}' is invalid:\n{}", format_issues(.issues))]
    InvalidWorkplan {
        workplan: String,
        issues: Vec<ValidationError>,
    },

    #[error("place '{0}' is not part of the workplan")]
    UnknownPlace(String),

    #[error("step '{0}' is not part of the workplan")]
    UnknownStep(String),

    /// A token was removed from a place that does not hold it.
    #[error("token {token} is not held by place '{place}'")]
    TokenNotPresent { place: String, token: TokenId },

    /// A transition received a token it cannot accept (e.g. a join fed by
    /// something other than a split).
    #[error("transition '{step}' received unexpected token {token}: {reason}")]
    UnexpectedToken {
        step: String,
        token: TokenId,
        reason: String,
    },

    #[error("transition '{step}' has no output {index} ({available} outputs)")]
    InvalidOutput {
        step: String,
        index: usize,
        available: usize,
    },

    /// A transition failed while computing its output.
    #[error("transition '{step}' failed: {reason}")]
    TransitionFailed { step: String, reason: String },

    #[error("sub-workflow '{step}' cannot map terminal place '{place}' to an output")]
    UnresolvedTerminal { step: String, place: String },

    #[error("transition '{step}' is not waiting on token {token}")]
    NotAwaiting { step: String, token: TokenId },

    #[error("cannot {operation} an engine that is {status}")]
    InvalidState {
        operation: &'static str,
        status: EngineStatus,
    },

    /// The snapshot was captured from a different workplan definition.
    #[error("snapshot does not match workplan '{workplan}': {reason}")]
    SnapshotMismatch { workplan: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Returns true if the error leaves the engine unusable.
    ///
    /// Caller mistakes (unknown step, bad output index, wrong state) are
    /// rejected before anything is mutated and do not halt the engine.
    pub fn halts_engine(&self) -> bool {
        !matches!(
            self,
            Self::UnknownStep(_)
                | Self::UnknownPlace(_)
                | Self::InvalidOutput { .. }
                | Self::NotAwaiting { .. }
                | Self::InvalidState { .. }
        )
    }
}

fn format_issues(issues: &[ValidationError]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {}", issue))
        .collect::<Vec<_>>()
        .join("\n")
}
