//! Error types for manifest loading and validation.

use thiserror::Error;

/// Reasons a manifest is excluded from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field '{field}'")]
    MissingField { field: String },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("unknown provider kind '{kind}'")]
    UnknownProviderKind { kind: String },

    #[error("invalid provider reference '{reference}' (expected kind:tool_id)")]
    InvalidProviderRef { reference: String },

    #[error("provider kind '{kind}' is not registered")]
    UnregisteredProviderKind { kind: String },

    #[error("plugin image '{image}' must be pinned by sha256 digest")]
    UnpinnedImage { image: String },

    #[error("source '{path}': {reason}")]
    Source { path: String, reason: String },

    #[error("source '{path}' digest mismatch: pinned {expected}, found {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("unknown schema id '{schema_id}'")]
    UnknownSchema { schema_id: String },

    #[error("unsupported value at '{path}': {reason}")]
    UnsupportedValue { path: String, reason: String },

    #[error("duplicate skill id '{id}' (also declared in {other})")]
    DuplicateId { id: String, other: String },

    #[error("security hash: {0}")]
    Hash(String),

    #[error("io error: {0}")]
    Io(String),
}

/// Result type for manifest operations.
pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

impl From<crate::hash::HashError> for ManifestError {
    fn from(err: crate::hash::HashError) -> Self {
        ManifestError::Hash(err.to_string())
    }
}
