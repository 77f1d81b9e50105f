//! Error types for the sandbox runtime.

use crate::error::ErrorCode;

/// A forbidden pattern found by preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightViolation {
    pub rule: String,
    pub path: String,
    /// 1-based; 0 when the violation is about the manifest rather than a line.
    pub line: usize,
}

impl std::fmt::Display for PreflightViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "rule '{}' ({})", self.rule, self.path)
        } else {
            write!(f, "rule '{}' at {}:{}", self.rule, self.path, self.line)
        }
    }
}

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("preflight denied: {0}")]
    PreflightDenied(PreflightViolation),

    #[error("skill '{skill_id}' declares no plugin container")]
    NotAPlugin { skill_id: String },

    #[error("wall clock limit of {limit_ms}ms exceeded")]
    Timeout { limit_ms: u64 },

    #[error("container exited with code {code}")]
    Crashed { code: i64 },

    #[error("plugin output invalid: {reason}")]
    InvalidOutput { reason: String },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("staging failed: {0}")]
    Staging(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SandboxError::PreflightDenied(_) => ErrorCode::PreflightDenied,
            SandboxError::NotAPlugin { .. } => ErrorCode::CapabilityInvalid,
            SandboxError::Timeout { .. } => ErrorCode::SandboxTimeout,
            SandboxError::InvalidOutput { .. } => ErrorCode::SchemaInvalid,
            SandboxError::Crashed { .. } | SandboxError::Runtime(_) | SandboxError::Staging(_) => {
                ErrorCode::SandboxCrashed
            }
        }
    }

    /// Diagnostic safe to return to callers. Runtime and staging details stay
    /// in the logs.
    pub fn public_detail(&self) -> String {
        match self {
            SandboxError::Runtime(_) => "container runtime failure".to_string(),
            SandboxError::Staging(_) => "failed to stage sandbox inputs".to_string(),
            other => other.to_string(),
        }
    }
}
