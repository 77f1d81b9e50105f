//! Caller-facing request and response types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use skillgate_state::Outcome;

use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub agent_id: String,
    pub skill_id: String,
    pub tool_args: Value,
    #[serde(default)]
    pub session_context: Value,
    /// Relative to the moment `invoke` is called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(agent_id: impl Into<String>, skill_id: impl Into<String>, tool_args: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            skill_id: skill_id.into(),
            tool_args,
            session_context: Value::Null,
            deadline: None,
        }
    }

    pub fn with_session(mut self, session_context: Value) -> Self {
        self.session_context = session_context;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Normalized result envelope. Carries no provider kind, container detail
/// or hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub status: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-(agent, skill) receipt sequence; absent if the receipt write failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_seq: Option<u64>,
}

impl InvocationResponse {
    pub fn is_ok(&self) -> bool {
        self.status == Outcome::Ok
    }
}
