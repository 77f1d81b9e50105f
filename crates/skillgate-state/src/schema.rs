//! Row types for the skillgate SurrealDB tables
//!
//! Tables:
//! - grants: approval grants keyed by (agent_id, skill_id, security_hash)
//! - checkpoints: single-use write approvals
//! - receipts: append-only provenance log keyed by invocation_id
//!
//! Rows carry `surrealdb::sql::Datetime` so timestamps are stored as native
//! datetimes and sort correctly; conversion to the `storage_traits` types
//! happens at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::error::StorageError;
use crate::storage_traits::{
    AppliedLimits, Grant, GrantMode, Outcome, OutputRef, ProvenanceReceipt, SecurityHash,
    StorageResult, WriteCheckpoint,
};

fn parse_hash(table: &str, raw: String) -> StorageResult<SecurityHash> {
    SecurityHash::try_from(raw).map_err(|e| StorageError::Corrupt {
        table: table.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GrantRow {
    pub agent_id: String,
    pub skill_id: String,
    pub security_hash: String,
    pub mode: GrantMode,
    pub granted_at: SurrealDatetime,
    pub granted_by: Option<String>,
}

impl From<Grant> for GrantRow {
    fn from(g: Grant) -> Self {
        Self {
            agent_id: g.agent_id,
            skill_id: g.skill_id,
            security_hash: g.security_hash.into(),
            mode: g.mode,
            granted_at: SurrealDatetime::from(g.granted_at),
            granted_by: g.granted_by,
        }
    }
}

impl GrantRow {
    pub fn into_grant(self) -> StorageResult<Grant> {
        Ok(Grant {
            security_hash: parse_hash("grants", self.security_hash)?,
            agent_id: self.agent_id,
            skill_id: self.skill_id,
            mode: self.mode,
            granted_at: DateTime::<Utc>::from(self.granted_at),
            granted_by: self.granted_by,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CheckpointRow {
    pub checkpoint_id: String,
    pub agent_id: String,
    pub skill_id: String,
    pub security_hash: String,
    pub approved_by: String,
    pub approved_at: SurrealDatetime,
    pub expires_at: Option<SurrealDatetime>,
    pub note: Option<String>,
}

impl From<WriteCheckpoint> for CheckpointRow {
    fn from(cp: WriteCheckpoint) -> Self {
        Self {
            checkpoint_id: cp.checkpoint_id,
            agent_id: cp.agent_id,
            skill_id: cp.skill_id,
            security_hash: cp.security_hash.into(),
            approved_by: cp.approved_by,
            approved_at: SurrealDatetime::from(cp.approved_at),
            expires_at: cp.expires_at.map(SurrealDatetime::from),
            note: cp.note,
        }
    }
}

impl CheckpointRow {
    pub fn into_checkpoint(self) -> StorageResult<WriteCheckpoint> {
        Ok(WriteCheckpoint {
            security_hash: parse_hash("checkpoints", self.security_hash)?,
            checkpoint_id: self.checkpoint_id,
            agent_id: self.agent_id,
            skill_id: self.skill_id,
            approved_by: self.approved_by,
            approved_at: DateTime::<Utc>::from(self.approved_at),
            expires_at: self.expires_at.map(DateTime::<Utc>::from),
            note: self.note,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReceiptRow {
    pub invocation_id: String,
    pub agent_id: String,
    pub skill_id: String,
    pub manifest_version: Option<String>,
    pub security_hash: Option<String>,
    pub limits: Option<AppliedLimits>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub error_code: Option<String>,
    pub output: Option<OutputRef>,
    pub seq: u64,
    pub recorded_at: SurrealDatetime,
}

impl From<ProvenanceReceipt> for ReceiptRow {
    fn from(r: ProvenanceReceipt) -> Self {
        Self {
            invocation_id: r.invocation_id,
            agent_id: r.agent_id,
            skill_id: r.skill_id,
            manifest_version: r.manifest_version,
            security_hash: r.security_hash.map(String::from),
            limits: r.limits,
            duration_ms: r.duration_ms,
            outcome: r.outcome,
            error_code: r.error_code,
            output: r.output,
            seq: r.seq,
            recorded_at: SurrealDatetime::from(r.recorded_at),
        }
    }
}

impl ReceiptRow {
    pub fn into_receipt(self) -> StorageResult<ProvenanceReceipt> {
        Ok(ProvenanceReceipt {
            security_hash: self
                .security_hash
                .map(|h| parse_hash("receipts", h))
                .transpose()?,
            invocation_id: self.invocation_id,
            agent_id: self.agent_id,
            skill_id: self.skill_id,
            manifest_version: self.manifest_version,
            limits: self.limits,
            duration_ms: self.duration_ms,
            outcome: self.outcome,
            error_code: self.error_code,
            output: self.output,
            seq: self.seq,
            recorded_at: DateTime::<Utc>::from(self.recorded_at),
        })
    }
}
