//! Provider error types and their mapping onto [`ErrorCode`].

use thiserror::Error;

use crate::error::{ErrorCode, InvocationError};
use crate::sandbox::SandboxError;

/// Backend failures, normalized before they leave the registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no handler registered for '{reference}'")]
    Unresolved { reference: String },

    #[error("invalid arguments for '{tool_id}': {reason}")]
    InvalidArguments { tool_id: String, reason: String },

    #[error("transport unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("remote tool rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("response is not valid JSON: {reason}")]
    InvalidResponse { reason: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::Unresolved { .. } => ErrorCode::ProviderUnresolved,
            ProviderError::InvalidArguments { .. } | ProviderError::InvalidResponse { .. } => {
                ErrorCode::SchemaInvalid
            }
            ProviderError::Unavailable { .. } | ProviderError::Rejected { .. } => {
                ErrorCode::TransportUnavailable
            }
            ProviderError::Sandbox(e) => e.code(),
        }
    }

    /// Only connection-level failures are worth a second attempt; a 4xx
    /// rejection will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable { .. })
    }

    pub fn into_invocation_error(self) -> InvocationError {
        let code = self.code();
        let retryable = self.is_retryable();
        let detail = match &self {
            ProviderError::Sandbox(e) => e.public_detail(),
            other => other.to_string(),
        };
        InvocationError {
            code,
            detail,
            retryable,
        }
    }
}

impl From<ProviderError> for InvocationError {
    fn from(err: ProviderError) -> Self {
        err.into_invocation_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        let transient = ProviderError::Unavailable {
            reason: "connection refused".into(),
        }
        .into_invocation_error();
        assert_eq!(transient.code, ErrorCode::TransportUnavailable);
        assert!(transient.retryable);

        let rejected = ProviderError::Rejected { status: 404 }.into_invocation_error();
        assert_eq!(rejected.code, ErrorCode::TransportUnavailable);
        assert!(!rejected.retryable);
    }

    #[test]
    fn test_sandbox_errors_keep_their_codes() {
        let timeout: InvocationError =
            ProviderError::from(SandboxError::Timeout { limit_ms: 10 }).into();
        assert_eq!(timeout.code, ErrorCode::SandboxTimeout);
        assert!(!timeout.retryable);

        let runtime: InvocationError =
            ProviderError::from(SandboxError::Runtime("docker: secret stderr".into())).into();
        assert_eq!(runtime.code, ErrorCode::SandboxCrashed);
        assert!(!runtime.detail.contains("secret"));
    }
}
