//! Policy gate: PREFLIGHT -> RULES -> GRANT_CHECK.
//!
//! The gate reads governance state but never writes it; consumption of a
//! single-use authorization happens together with the receipt.

use std::sync::Arc;

use skillgate_state::{Consume, GovernanceStore, GrantMode, SecurityHash};
use tracing::warn;

use super::rules::{AccessRules, RuleAction};
use crate::error::{ErrorCode, InvocationError};
use crate::manifest::SkillEntry;
use crate::sandbox::Preflight;

/// Why an invocation was allowed to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// An `allow` rule; read-only skills only.
    Rule,
    /// Standing always-allow grant for the current hash.
    StandingGrant,
    /// Single-use grant, consumed on success.
    RunOnce { security_hash: SecurityHash },
    /// Human write-approval checkpoint, consumed on success.
    Checkpoint { checkpoint_id: String },
}

impl Authorization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authorization::Rule => "rule",
            Authorization::StandingGrant => "always-allow",
            Authorization::RunOnce { .. } => "run-once",
            Authorization::Checkpoint { .. } => "checkpoint",
        }
    }

    pub fn is_single_use(&self) -> bool {
        self.consume().is_some()
    }

    /// What a successful invocation consumes.
    pub fn consume(&self) -> Option<Consume> {
        match self {
            Authorization::RunOnce { security_hash } => Some(Consume::RunOnceGrant {
                security_hash: security_hash.clone(),
            }),
            Authorization::Checkpoint { checkpoint_id } => Some(Consume::Checkpoint {
                checkpoint_id: checkpoint_id.clone(),
            }),
            Authorization::Rule | Authorization::StandingGrant => None,
        }
    }
}

pub struct PolicyGate {
    store: Arc<dyn GovernanceStore>,
    preflight: Arc<Preflight>,
    rules: AccessRules,
}

impl PolicyGate {
    pub fn new(store: Arc<dyn GovernanceStore>, preflight: Arc<Preflight>, rules: AccessRules) -> Self {
        Self {
            store,
            preflight,
            rules,
        }
    }

    /// Decide whether `agent_id` may invoke `skill` as it is loaded now.
    ///
    /// Store failures deny (`policy_denied`); the gate never fails open.
    pub async fn evaluate(
        &self,
        agent_id: &str,
        skill: &SkillEntry,
    ) -> Result<Authorization, InvocationError> {
        // PREFLIGHT: manifest and sources only, never overridable.
        if let Err(violation) = self.preflight.check(skill) {
            return Err(InvocationError::new(
                ErrorCode::PreflightDenied,
                violation.to_string(),
            ));
        }

        // RULES
        let rule = self.rules.first_match(agent_id, skill.id());
        if let Some(r) = rule.filter(|r| r.action == RuleAction::Deny) {
            let detail = match &r.reason {
                Some(reason) => format!("denied by access rule: {reason}"),
                None => "denied by access rule".to_string(),
            };
            return Err(InvocationError::new(ErrorCode::PolicyDenied, detail));
        }

        // GRANT_CHECK
        let hash = &skill.security_hash;
        let needs_checkpoint = skill.manifest.isolation.write_access
            || rule.is_some_and(|r| r.action == RuleAction::RequireCheckpoint);
        if needs_checkpoint {
            let checkpoint = self
                .store
                .lookup_checkpoint(agent_id, skill.id(), hash)
                .await
                .map_err(store_failure)?;
            return match checkpoint {
                Some(cp) => Ok(Authorization::Checkpoint {
                    checkpoint_id: cp.checkpoint_id,
                }),
                None => Err(InvocationError::new(
                    ErrorCode::ApprovalRequired,
                    "side-effecting skill requires a write-approval checkpoint",
                )),
            };
        }

        if rule.is_some_and(|r| r.action == RuleAction::Allow) {
            return Ok(Authorization::Rule);
        }

        let grant = self
            .store
            .lookup(agent_id, skill.id(), hash)
            .await
            .map_err(store_failure)?;
        match grant {
            Some(g) if g.mode == GrantMode::AlwaysAllow => Ok(Authorization::StandingGrant),
            Some(g) => Ok(Authorization::RunOnce {
                security_hash: g.security_hash,
            }),
            None => Err(InvocationError::new(
                ErrorCode::ApprovalRequired,
                "no grant for the current skill version",
            )),
        }
    }
}

fn store_failure(err: skillgate_state::StorageError) -> InvocationError {
    warn!(error = %err, "governance store lookup failed; denying");
    InvocationError::new(ErrorCode::PolicyDenied, "governance store unavailable")
}
