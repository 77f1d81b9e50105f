//! Stable error-code surface returned to every caller.
//!
//! Internal errors (`ManifestError`, `ProviderError`, `SandboxError`, ...) are
//! mapped to exactly one [`ErrorCode`] at the orchestrator boundary. Only the
//! code and a non-sensitive diagnostic string ever leave the substrate.

use serde::{Deserialize, Serialize};
use skillgate_state::Outcome;

/// The closed set of error codes callers can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapabilityInvalid,
    ProviderUnresolved,
    PreflightDenied,
    ApprovalRequired,
    PolicyDenied,
    SandboxTimeout,
    SandboxCrashed,
    SchemaInvalid,
    TransportUnavailable,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::CapabilityInvalid,
        ErrorCode::ProviderUnresolved,
        ErrorCode::PreflightDenied,
        ErrorCode::ApprovalRequired,
        ErrorCode::PolicyDenied,
        ErrorCode::SandboxTimeout,
        ErrorCode::SandboxCrashed,
        ErrorCode::SchemaInvalid,
        ErrorCode::TransportUnavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapabilityInvalid => "capability_invalid",
            ErrorCode::ProviderUnresolved => "provider_unresolved",
            ErrorCode::PreflightDenied => "preflight_denied",
            ErrorCode::ApprovalRequired => "approval_required",
            ErrorCode::PolicyDenied => "policy_denied",
            ErrorCode::SandboxTimeout => "sandbox_timeout",
            ErrorCode::SandboxCrashed => "sandbox_crashed",
            ErrorCode::SchemaInvalid => "schema_invalid",
            ErrorCode::TransportUnavailable => "transport_unavailable",
        }
    }

    /// Whether this class of failure may ever be retried.
    ///
    /// Only transport failures qualify; an individual failure can still be
    /// marked permanent (see [`InvocationError::retryable`]).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::TransportUnavailable)
    }

    /// Receipt outcome recorded for a failure with this code.
    pub fn outcome(&self) -> Outcome {
        match self {
            ErrorCode::PreflightDenied | ErrorCode::ApprovalRequired | ErrorCode::PolicyDenied => {
                Outcome::Denied
            }
            ErrorCode::SandboxTimeout => Outcome::TimedOut,
            ErrorCode::CapabilityInvalid
            | ErrorCode::ProviderUnresolved
            | ErrorCode::SandboxCrashed
            | ErrorCode::SchemaInvalid
            | ErrorCode::TransportUnavailable => Outcome::Failed,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure normalized to the stable taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct InvocationError {
    pub code: ErrorCode,
    /// Non-sensitive diagnostic; never contains arguments, outputs or raw
    /// backend errors.
    pub detail: String,
    /// Set only for transient transport failures.
    pub retryable: bool,
}

impl InvocationError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            retryable: false,
        }
    }

    /// Transient transport failure eligible for the single retry.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::TransportUnavailable,
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.code.outcome()
    }
}
