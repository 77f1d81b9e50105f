//! SurrealDB-backed GovernanceStore implementation
//!
//! Uses the row types in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary. Per-key sequence numbers are
//! computed under the in-process key lock, so a database file must have a
//! single writer process.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::handle::{self, StoreConfig};
use crate::keyed_lock::KeyedLocks;
use crate::schema::{CheckpointRow, GrantRow, ReceiptRow};
use crate::storage_traits::{
    Consume, GovernanceStore, Grant, GrantMode, ProvenanceReceipt, SecurityHash, StorageResult,
    WriteCheckpoint,
};

/// SurrealDB-backed implementation of [`GovernanceStore`].
pub struct SurrealGovernanceStore {
    db: Surreal<Any>,
    writes: KeyedLocks,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    n: u64,
}

impl SurrealGovernanceStore {
    /// Connect using `config` and initialize the schema.
    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        let db = handle::connect(config).await?;
        info!(url = %config.url, "SurrealGovernanceStore connected");
        Ok(Self::from_db(db))
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    /// Wrap an already-connected handle whose schema is initialized.
    pub fn from_db(db: Surreal<Any>) -> Self {
        Self {
            db,
            writes: KeyedLocks::new(),
        }
    }

    async fn receipt_count_for(&self, agent_id: &str, skill_id: &str) -> StorageResult<u64> {
        let rows: Vec<CountRow> = self
            .db
            .query(
                "SELECT count() AS n FROM receipts \
                 WHERE agent_id = $agent AND skill_id = $skill GROUP ALL",
            )
            .bind(("agent", agent_id.to_string()))
            .bind(("skill", skill_id.to_string()))
            .await?
            .take(0)?;
        Ok(rows.first().map(|r| r.n).unwrap_or(0))
    }
}

#[async_trait]
impl GovernanceStore for SurrealGovernanceStore {
    #[instrument(skip(self, hash), fields(hash = %hash.short()))]
    async fn lookup(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<Grant>> {
        let rows: Vec<GrantRow> = self
            .db
            .query(
                "SELECT * FROM grants \
                 WHERE agent_id = $agent AND skill_id = $skill AND security_hash = $hash",
            )
            .bind(("agent", agent_id.to_string()))
            .bind(("skill", skill_id.to_string()))
            .bind(("hash", hash.as_str().to_string()))
            .await?
            .take(0)?;

        rows.into_iter().next().map(GrantRow::into_grant).transpose()
    }

    #[instrument(skip(self, grant), fields(key = %grant.key(), mode = %grant.mode))]
    async fn record(&self, grant: Grant) -> StorageResult<()> {
        let key = grant.key();
        let _write = self.writes.acquire(&key).await;

        if grant.mode == GrantMode::RunOnce {
            if let Some(existing) = self
                .lookup(&grant.agent_id, &grant.skill_id, &grant.security_hash)
                .await?
            {
                if existing.mode == GrantMode::AlwaysAllow {
                    debug!("always-allow grant already covers run-once request");
                    return Ok(());
                }
            }
        }

        // always-allow clears every prior grant for the key; run-once only
        // replaces the slot for its own hash.
        let clear = match grant.mode {
            GrantMode::AlwaysAllow => {
                "DELETE grants WHERE agent_id = $agent AND skill_id = $skill;"
            }
            GrantMode::RunOnce => {
                "DELETE grants WHERE agent_id = $agent AND skill_id = $skill \
                 AND security_hash = $hash;"
            }
        };
        let sql = format!(
            "BEGIN TRANSACTION; {clear} CREATE grants CONTENT $row; COMMIT TRANSACTION;"
        );

        let hash = grant.security_hash.as_str().to_string();
        let row = GrantRow::from(grant);
        self.db
            .query(sql)
            .bind(("agent", key.agent_id.clone()))
            .bind(("skill", key.skill_id.clone()))
            .bind(("hash", hash))
            .bind(("row", row))
            .await?
            .check()?;

        debug!("grant recorded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn revoke(&self, agent_id: &str, skill_id: &str) -> StorageResult<usize> {
        let key = crate::storage_traits::GrantKey::new(agent_id, skill_id);
        let _write = self.writes.acquire(&key).await;

        // Transaction markers yield no result, so the grant delete is index 0.
        let mut response = self
            .db
            .query(
                "BEGIN TRANSACTION; \
                 DELETE grants WHERE agent_id = $agent AND skill_id = $skill RETURN BEFORE; \
                 DELETE checkpoints WHERE agent_id = $agent AND skill_id = $skill; \
                 COMMIT TRANSACTION;",
            )
            .bind(("agent", agent_id.to_string()))
            .bind(("skill", skill_id.to_string()))
            .await?
            .check()?;
        let removed: Vec<GrantRow> = response.take(0)?;

        info!(removed = removed.len(), "grants revoked");
        Ok(removed.len())
    }

    #[instrument(skip(self, checkpoint), fields(key = %checkpoint.key(), checkpoint_id = %checkpoint.checkpoint_id))]
    async fn record_checkpoint(&self, checkpoint: WriteCheckpoint) -> StorageResult<()> {
        let _write = self.writes.acquire(&checkpoint.key()).await;

        let row = CheckpointRow::from(checkpoint);
        let _created: Option<CheckpointRow> = self.db.create("checkpoints").content(row).await?;
        Ok(())
    }

    #[instrument(skip(self, hash), fields(hash = %hash.short()))]
    async fn lookup_checkpoint(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<WriteCheckpoint>> {
        let rows: Vec<CheckpointRow> = self
            .db
            .query(
                "SELECT * FROM checkpoints \
                 WHERE agent_id = $agent AND skill_id = $skill AND security_hash = $hash \
                 ORDER BY approved_at ASC",
            )
            .bind(("agent", agent_id.to_string()))
            .bind(("skill", skill_id.to_string()))
            .bind(("hash", hash.as_str().to_string()))
            .await?
            .take(0)?;

        let now = Utc::now();
        for row in rows {
            let cp = row.into_checkpoint()?;
            if !cp.is_expired_at(now) {
                return Ok(Some(cp));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, receipt, consume), fields(invocation_id = %receipt.invocation_id, outcome = %receipt.outcome))]
    async fn commit(
        &self,
        mut receipt: ProvenanceReceipt,
        consume: Option<Consume>,
    ) -> StorageResult<ProvenanceReceipt> {
        let key = receipt.key();
        let _write = self.writes.acquire(&key).await;

        if self.receipt(&receipt.invocation_id).await?.is_some() {
            return Err(StorageError::DuplicateReceipt {
                invocation_id: receipt.invocation_id,
            });
        }

        receipt.seq = self.receipt_count_for(&key.agent_id, &key.skill_id).await? + 1;

        let (consume_sql, target) = match consume {
            Some(Consume::RunOnceGrant { security_hash }) => (
                "DELETE grants WHERE agent_id = $agent AND skill_id = $skill \
                 AND security_hash = $target AND mode = 'run-once';",
                String::from(security_hash),
            ),
            Some(Consume::Checkpoint { checkpoint_id }) => (
                "DELETE checkpoints WHERE checkpoint_id = $target;",
                checkpoint_id,
            ),
            None => ("", String::new()),
        };
        let sql = format!(
            "BEGIN TRANSACTION; {consume_sql} CREATE receipts CONTENT $row; COMMIT TRANSACTION;"
        );

        let row = ReceiptRow::from(receipt.clone());
        self.db
            .query(sql)
            .bind(("agent", key.agent_id.clone()))
            .bind(("skill", key.skill_id.clone()))
            .bind(("target", target))
            .bind(("row", row))
            .await?
            .check()?;

        debug!(seq = receipt.seq, "receipt committed");
        Ok(receipt)
    }

    #[instrument(skip(self))]
    async fn receipt(&self, invocation_id: &str) -> StorageResult<Option<ProvenanceReceipt>> {
        let rows: Vec<ReceiptRow> = self
            .db
            .query("SELECT * FROM receipts WHERE invocation_id = $id")
            .bind(("id", invocation_id.to_string()))
            .await?
            .take(0)?;

        rows.into_iter()
            .next()
            .map(ReceiptRow::into_receipt)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn receipts_for(
        &self,
        agent_id: &str,
        skill_id: &str,
    ) -> StorageResult<Vec<ProvenanceReceipt>> {
        let rows: Vec<ReceiptRow> = self
            .db
            .query(
                "SELECT * FROM receipts \
                 WHERE agent_id = $agent AND skill_id = $skill ORDER BY seq ASC",
            )
            .bind(("agent", agent_id.to_string()))
            .bind(("skill", skill_id.to_string()))
            .await?
            .take(0)?;

        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }
}
