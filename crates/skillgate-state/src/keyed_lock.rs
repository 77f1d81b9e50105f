//! Per-key async locks serializing writes for one `(agent_id, skill_id)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::storage_traits::GrantKey;

/// Lazily-created async mutex per [`GrantKey`].
///
/// Holders of different keys never contend. Idle entries (no guard alive)
/// are pruned on the next acquire.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<GrantKey, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &GrantKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
