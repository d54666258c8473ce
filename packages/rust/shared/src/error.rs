//! Error types for Phasewatch.
//!
//! Library crates use [`PhasewatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Phasewatch operations.
#[derive(Debug, thiserror::Error)]
pub enum PhasewatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid caller input.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// `end_phase` was called for a name with no active phase.
    #[error("no active phase named '{name}'")]
    NoActivePhase { name: String },

    /// A phase was asked to end in a status that is not terminal.
    #[error("'{status}' is not a terminal phase status")]
    NonTerminalStatus { status: String },

    /// Terminal setup or teardown failed.
    #[error("terminal error: {0}")]
    Terminal(#[from] std::io::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PhasewatchError>;

impl PhasewatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error reports caller misuse of the phase API.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::NoActivePhase { .. } | Self::NonTerminalStatus { .. }
        )
    }
}
