//! Error handling utilities shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Convenient result type used throughout the crate.
pub type Result<T, E = IftError> = std::result::Result<T, E>;

/// Domain-specific error describing failures while fitting, persisting, or serving the model.
#[derive(Debug, Error)]
pub enum IftError {
    /// The training corpus cannot support a fit (empty after cleaning, fully-null column).
    #[error("data quality error: {0}")]
    DataQuality(String),
    /// A prediction request is missing a declared field or carries the wrong primitive type.
    #[error("schema mismatch on field `{field}`: {reason}")]
    SchemaMismatch {
        /// Name of the offending field.
        field: String,
        /// Human readable description of the mismatch.
        reason: String,
    },
    /// A persisted artifact is missing, corrupt, or inconsistent with its sidecar.
    #[error("failed to load artifact {path:?}: {reason}")]
    ArtifactLoad {
        /// Artifact path that could not be loaded.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
    /// The regression pipeline could not be fitted on the supplied matrix.
    #[error("model fit error: {0}")]
    Fit(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Filesystem IO error with optional context path.
    #[error("io error while processing {path:?}: {source}")]
    Io {
        /// Underlying IO error returned by the standard library.
        source: std::io::Error,
        /// Target path associated with the IO failure if available.
        path: Option<PathBuf>,
    },
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The corpus supplier failed to produce rows.
    #[error("corpus source error: {0}")]
    Source(String),
    /// Catch-all variant for invariants that should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for IftError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl IftError {
    /// Helper constructor that attaches an optional path when wrapping IO errors.
    pub fn io(source: std::io::Error, path: Option<PathBuf>) -> Self {
        Self::Io { source, path }
    }

    /// Helper constructor for request-scoped schema mismatches.
    pub fn schema_mismatch(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Helper constructor for artifact load failures.
    pub fn artifact_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArtifactLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error is scoped to a single request and should be
    /// reported to the caller rather than aborting the process.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }
}
