//! Structured observability hooks for the invocation lifecycle.
//!
//! Every event carries `event = "<name>"` so log pipelines can filter on it.
//! Tool arguments, outputs and environment values are never passed here.

use tracing::{info, warn, Span};

use crate::error::ErrorCode;

/// Invocation-scoped tracing span (`skillgate.invocation`).
///
/// The invocation future runs across await points, so the span is attached
/// with [`InvocationSpan::instrument`] rather than entered.
#[derive(Debug, Clone)]
pub struct InvocationSpan {
    span: Span,
}

impl InvocationSpan {
    pub fn new(invocation_id: &str, agent_id: &str, skill_id: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "skillgate.invocation",
                invocation_id = %invocation_id,
                agent_id = %agent_id,
                skill_id = %skill_id,
            ),
        }
    }

    pub fn instrument<F: std::future::Future>(&self, fut: F) -> tracing::instrument::Instrumented<F> {
        use tracing::Instrument;
        fut.instrument(self.span.clone())
    }
}

pub fn emit_invocation_started(invocation_id: &str, agent_id: &str, skill_id: &str) {
    info!(
        event = "invocation.started",
        invocation_id = %invocation_id,
        agent_id = %agent_id,
        skill_id = %skill_id,
    );
}

/// Gate decision: `verdict` is the authorization kind or the denial code.
pub fn emit_gate_evaluated(invocation_id: &str, verdict: &str, security_hash: &str) {
    info!(
        event = "gate.evaluated",
        invocation_id = %invocation_id,
        verdict = %verdict,
        security_hash = %security_hash,
    );
}

pub fn emit_container_destroyed(invocation_id: &str, container: &str, reason: &str) {
    info!(
        event = "sandbox.container_destroyed",
        invocation_id = %invocation_id,
        container = %container,
        reason = %reason,
    );
}

pub fn emit_retry(invocation_id: &str, attempt: u32, code: ErrorCode, backoff_ms: u64) {
    warn!(
        event = "invocation.retry",
        invocation_id = %invocation_id,
        attempt = attempt,
        code = %code,
        backoff_ms = backoff_ms,
    );
}

pub fn emit_invocation_finished(
    invocation_id: &str,
    outcome: &str,
    code: Option<ErrorCode>,
    duration_ms: u64,
) {
    info!(
        event = "invocation.finished",
        invocation_id = %invocation_id,
        outcome = %outcome,
        code = code.map(|c| c.as_str()).unwrap_or("none"),
        duration_ms = duration_ms,
    );
}

/// The receipt could not be written. The caller still gets its response.
pub fn emit_receipt_persist_failed(invocation_id: &str, error: &dyn std::fmt::Display) {
    tracing::error!(event = "receipt.persist_failed", invocation_id = %invocation_id, error = %error);
}
