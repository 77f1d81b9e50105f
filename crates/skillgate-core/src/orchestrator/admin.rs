//! Operator actions: grants, write approvals, revocation and audit reads.
//!
//! Grants and checkpoints are always bound to the security hash of the
//! skill as loaded in the current snapshot.

use skillgate_state::{Grant, GrantMode, ProvenanceReceipt, StorageError, WriteCheckpoint};
use thiserror::Error;
use tracing::info;

use super::Orchestrator;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("skill '{skill_id}' is not in the current snapshot")]
    UnknownSkill { skill_id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Orchestrator {
    /// Record a grant for the skill's current security hash.
    pub async fn grant(
        &self,
        agent_id: &str,
        skill_id: &str,
        mode: GrantMode,
        granted_by: Option<&str>,
    ) -> Result<Grant, AdminError> {
        let hash = self.current_hash(skill_id)?;
        let mut grant = Grant::new(agent_id, skill_id, hash, mode);
        if let Some(who) = granted_by {
            grant = grant.with_granted_by(who);
        }
        self.store.record(grant.clone()).await?;
        info!(
            event = "grant.recorded",
            agent_id,
            skill_id,
            mode = %mode,
            security_hash = %grant.security_hash.short(),
        );
        Ok(grant)
    }

    /// Record a single-use human approval for a side-effecting invocation.
    pub async fn approve_write(
        &self,
        agent_id: &str,
        skill_id: &str,
        approved_by: &str,
        ttl_secs: Option<u64>,
        note: Option<&str>,
    ) -> Result<WriteCheckpoint, AdminError> {
        let hash = self.current_hash(skill_id)?;
        let mut checkpoint = WriteCheckpoint::new(agent_id, skill_id, hash, approved_by);
        if let Some(secs) = ttl_secs {
            checkpoint = checkpoint.with_timeout_secs(secs);
        }
        if let Some(n) = note {
            checkpoint = checkpoint.with_note(n);
        }
        self.store.record_checkpoint(checkpoint.clone()).await?;
        info!(
            event = "checkpoint.recorded",
            agent_id,
            skill_id,
            approved_by,
            checkpoint_id = %checkpoint.checkpoint_id,
        );
        Ok(checkpoint)
    }

    /// Remove every grant and pending checkpoint for the key. Works for
    /// skills that are no longer loaded.
    pub async fn revoke(&self, agent_id: &str, skill_id: &str) -> Result<usize, AdminError> {
        let removed = self.store.revoke(agent_id, skill_id).await?;
        info!(event = "grant.revoked", agent_id, skill_id, removed);
        Ok(removed)
    }

    pub async fn receipts(
        &self,
        agent_id: &str,
        skill_id: &str,
    ) -> Result<Vec<ProvenanceReceipt>, AdminError> {
        Ok(self.store.receipts_for(agent_id, skill_id).await?)
    }

    fn current_hash(&self, skill_id: &str) -> Result<skillgate_state::SecurityHash, AdminError> {
        self.security_hash(skill_id)
            .ok_or_else(|| AdminError::UnknownSkill {
                skill_id: skill_id.to_string(),
            })
    }
}
