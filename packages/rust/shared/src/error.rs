//! Error types for docpipe.
//!
//! Library crates use [`DocPipeError`] and [`StageError`] via `thiserror`.
//! The CLI wraps these with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all docpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum DocPipeError {
    /// Invalid stage ordering, missing executor binding, unknown stage name,
    /// or a malformed configuration file. Fatal before any work is scheduled.
    #[error("config error: {message}")]
    Config { message: String },

    /// A fingerprint sidecar exists but could not be parsed.
    ///
    /// Only returned by `FingerprintStore::try_load`; the orchestrator recovers
    /// from it locally and never surfaces it to the caller of `run`.
    #[error("corrupt metadata at {path:?}: {message}")]
    CorruptMetadata { path: PathBuf, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON encoding/decoding error outside of sidecar parsing.
    #[error("serialization error: {0}")]
    Serialize(String),

    /// A stage executor reported a failure.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Failure reported by a stage executor for one document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The stage's output does not match its source. Recoverable by re-running
    /// the producing stage.
    #[error("validation mismatch: {0}")]
    ValidationMismatch(String),

    /// Network or backend failure. Retryable by re-invoking the run.
    #[error("transient executor error: {0}")]
    Transient(String),

    /// The executor call exceeded its time budget.
    #[error("stage timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocPipeError>;

impl DocPipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a corrupt-metadata error for the sidecar at `path`.
    pub fn corrupt(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            path: path.into(),
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

    /// Whether this error aborts a run before scheduling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

impl StageError {
    /// Whether re-invoking the run without changes may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocPipeError::config("stage 'validate' must follow 'convert'");
        assert_eq!(
            err.to_string(),
            "config error: stage 'validate' must follow 'convert'"
        );
        assert!(err.is_fatal());

        let err = DocPipeError::corrupt("/docs/a.pdf.metadata.json", "expected value");
        assert!(err.to_string().contains("a.pdf.metadata.json"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn stage_error_retryability() {
        assert!(StageError::Transient("503".into()).is_retryable());
        assert!(StageError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!StageError::ValidationMismatch("table missing".into()).is_retryable());
        assert_eq!(
            StageError::Timeout(Duration::from_secs(30)).to_string(),
            "stage timed out after 30s"
        );
    }

    #[test]
    fn stage_error_converts_into_top_level() {
        let err: DocPipeError = StageError::Transient("connection reset".into()).into();
        assert_eq!(err.to_string(), "transient executor error: connection reset");
    }
}
