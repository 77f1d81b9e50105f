//! In-memory fake for the governance store (testing only)
//!
//! `MemoryGovernanceStore` satisfies the `GovernanceStore` contract without
//! any external dependencies. It is not durable across restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::keyed_lock::KeyedLocks;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    grants: HashMap<(GrantKey, SecurityHash), Grant>,
    checkpoints: BTreeMap<String, WriteCheckpoint>,
    receipts: HashMap<String, ProvenanceReceipt>,
    receipts_by_key: HashMap<GrantKey, Vec<String>>,
}

/// In-memory governance store backed by `HashMap`s behind an `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryGovernanceStore {
    tables: RwLock<Tables>,
    writes: KeyedLocks,
}

impl MemoryGovernanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of receipts across all keys.
    pub fn receipt_count(&self) -> usize {
        self.tables.read().unwrap().receipts.len()
    }

    /// Total number of stored grants (valid or stale).
    pub fn grant_count(&self) -> usize {
        self.tables.read().unwrap().grants.len()
    }
}

#[async_trait]
impl GovernanceStore for MemoryGovernanceStore {
    async fn lookup(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<Grant>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .grants
            .get(&(GrantKey::new(agent_id, skill_id), hash.clone()))
            .cloned())
    }

    async fn record(&self, grant: Grant) -> StorageResult<()> {
        let key = grant.key();
        let _write = self.writes.acquire(&key).await;
        let mut tables = self.tables.write().unwrap();
        match grant.mode {
            GrantMode::AlwaysAllow => {
                tables.grants.retain(|(k, _), _| k != &key);
            }
            GrantMode::RunOnce => {
                let slot = (key.clone(), grant.security_hash.clone());
                if let Some(existing) = tables.grants.get(&slot) {
                    if existing.mode == GrantMode::AlwaysAllow {
                        return Ok(());
                    }
                }
            }
        }
        tables
            .grants
            .insert((key, grant.security_hash.clone()), grant);
        Ok(())
    }

    async fn revoke(&self, agent_id: &str, skill_id: &str) -> StorageResult<usize> {
        let key = GrantKey::new(agent_id, skill_id);
        let _write = self.writes.acquire(&key).await;
        let mut tables = self.tables.write().unwrap();
        let before = tables.grants.len();
        tables.grants.retain(|(k, _), _| k != &key);
        let removed = before - tables.grants.len();
        tables.checkpoints.retain(|_, cp| cp.key() != key);
        Ok(removed)
    }

    async fn record_checkpoint(&self, checkpoint: WriteCheckpoint) -> StorageResult<()> {
        let _write = self.writes.acquire(&checkpoint.key()).await;
        let mut tables = self.tables.write().unwrap();
        tables
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint);
        Ok(())
    }

    async fn lookup_checkpoint(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<WriteCheckpoint>> {
        let now = Utc::now();
        let tables = self.tables.read().unwrap();
        let mut matching: Vec<&WriteCheckpoint> = tables
            .checkpoints
            .values()
            .filter(|cp| {
                cp.agent_id == agent_id
                    && cp.skill_id == skill_id
                    && &cp.security_hash == hash
                    && !cp.is_expired_at(now)
            })
            .collect();
        matching.sort_by_key(|cp| cp.approved_at);
        Ok(matching.first().map(|cp| (*cp).clone()))
    }

    async fn commit(
        &self,
        mut receipt: ProvenanceReceipt,
        consume: Option<Consume>,
    ) -> StorageResult<ProvenanceReceipt> {
        let key = receipt.key();
        let _write = self.writes.acquire(&key).await;
        let mut tables = self.tables.write().unwrap();

        if tables.receipts.contains_key(&receipt.invocation_id) {
            return Err(StorageError::DuplicateReceipt {
                invocation_id: receipt.invocation_id,
            });
        }

        match consume {
            Some(Consume::RunOnceGrant { security_hash }) => {
                let slot = (key.clone(), security_hash);
                if tables
                    .grants
                    .get(&slot)
                    .is_some_and(|g| g.mode == GrantMode::RunOnce)
                {
                    tables.grants.remove(&slot);
                }
            }
            Some(Consume::Checkpoint { checkpoint_id }) => {
                tables.checkpoints.remove(&checkpoint_id);
            }
            None => {}
        }

        let ids = tables.receipts_by_key.entry(key).or_default();
        receipt.seq = ids.len() as u64 + 1;
        ids.push(receipt.invocation_id.clone());
        tables
            .receipts
            .insert(receipt.invocation_id.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn receipt(&self, invocation_id: &str) -> StorageResult<Option<ProvenanceReceipt>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.receipts.get(invocation_id).cloned())
    }

    async fn receipts_for(
        &self,
        agent_id: &str,
        skill_id: &str,
    ) -> StorageResult<Vec<ProvenanceReceipt>> {
        let tables = self.tables.read().unwrap();
        let key = GrantKey::new(agent_id, skill_id);
        Ok(tables
            .receipts_by_key
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.receipts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
