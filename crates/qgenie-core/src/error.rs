//! Error types for qgenie bundle handling.
//!
//! Every failure of a resolve, unpack or pack call surfaces as a distinct
//! [`BundleError`] variant so callers can inspect what went wrong without
//! parsing messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::manifest::ModelKind;

/// Implementation-defined error returned by a [`crate::BundleUnpacker`].
pub type UnpackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the qgenie library.
#[derive(Debug, Error)]
pub enum BundleError {
    // Manifest errors
    #[error("Manifest unreadable at {path}: {source}")]
    ManifestUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest malformed at {path}: {message}")]
    ManifestMalformed {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("No recognized model section in {path}")]
    NoRecognizedSection { path: PathBuf },

    #[error("Expected a {expected} manifest, found {found}")]
    KindMismatch { expected: ModelKind, found: ModelKind },

    #[error("Referenced file for {field} does not exist: {path}")]
    PathResolutionFailure { field: String, path: PathBuf },

    // Bundle errors
    #[error("Failed to unpack {bundle}: {source}")]
    UnpackFailure {
        bundle: PathBuf,
        #[source]
        source: UnpackError,
    },

    #[error("Invalid bundle container: {message}")]
    Container { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    // Engine errors
    #[error("Inference engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("Engine creation failed: {message}")]
    EngineCreate { message: String },
}

/// Result type alias for qgenie operations.
pub type Result<T> = std::result::Result<T, BundleError>;

impl From<std::io::Error> for BundleError {
    fn from(err: std::io::Error) -> Self {
        BundleError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl BundleError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BundleError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a container format error.
    pub fn container(message: impl Into<String>) -> Self {
        BundleError::Container {
            message: message.into(),
        }
    }

    /// Create a malformed-manifest error without a parser source.
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        BundleError::ManifestMalformed {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Stable machine-readable code for this error.
    ///
    /// Used by the CLI for its exit summary and by hosts that map errors
    /// onto their own exception types.
    pub fn code(&self) -> &'static str {
        match self {
            BundleError::ManifestUnreadable { .. } => "manifest_unreadable",
            BundleError::ManifestMalformed { .. } => "manifest_malformed",
            BundleError::NoRecognizedSection { .. } => "no_recognized_section",
            BundleError::KindMismatch { .. } => "kind_mismatch",
            BundleError::PathResolutionFailure { .. } => "path_resolution_failure",
            BundleError::UnpackFailure { .. } => "unpack_failure",
            BundleError::Container { .. } => "invalid_container",
            BundleError::Io { .. } => "io",
            BundleError::Cancelled => "cancelled",
            BundleError::EngineUnavailable { .. } => "engine_unavailable",
            BundleError::EngineCreate { .. } => "engine_create",
        }
    }

    /// Check if re-invoking the operation might succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BundleError::ManifestUnreadable { .. }
                | BundleError::Io { .. }
                | BundleError::UnpackFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BundleError::KindMismatch {
            expected: ModelKind::Dialog,
            found: ModelKind::Embedding,
        };
        assert_eq!(err.to_string(), "Expected a dialog manifest, found embedding");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BundleError::Cancelled.code(), "cancelled");
        assert_eq!(
            BundleError::NoRecognizedSection {
                path: PathBuf::from("config.json")
            }
            .code(),
            "no_recognized_section"
        );
        assert_eq!(BundleError::container("bad magic").code(), "invalid_container");
    }

    #[test]
    fn test_retryable_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        assert!(BundleError::io_with_path(io, "/tmp/u").is_retryable());
        assert!(!BundleError::KindMismatch {
            expected: ModelKind::Dialog,
            found: ModelKind::TextEncoder,
        }
        .is_retryable());
    }

    #[test]
    fn test_unpack_failure_keeps_source() {
        let err = BundleError::UnpackFailure {
            bundle: PathBuf::from("model.bin"),
            source: Box::new(BundleError::container("Global CRC mismatch")),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Invalid bundle container: Global CRC mismatch")
        );
    }
}
