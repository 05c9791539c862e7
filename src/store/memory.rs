// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! In-memory counter store.

use super::{ensure_covered, lock_order, CounterStore, KeyGuard, Record, Result, StoreError, StoreKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Clone, Copy)]
struct Entry {
    record: Record,
    modified_at: i64,
}

/// Thread-safe counter store held in process memory.
#[derive(Clone)]
pub struct MemoryCounterStore {
    /// Stored records
    entries: Arc<RwLock<HashMap<StoreKey, Entry>>>,
    /// One async mutex per key currently in use
    locks: Arc<Mutex<HashMap<StoreKey, Arc<AsyncMutex<()>>>>>,
    /// Lock timeout for single-key operations
    lock_timeout: Duration,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Locks held on a [`MemoryCounterStore`].
pub struct MemoryGuard {
    keys: Vec<StoreKey>,
    _held: Vec<OwnedMutexGuard<()>>,
}

impl KeyGuard for MemoryGuard {
    fn covers(&self, key: &StoreKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn key_lock(&self, key: &StoreKey) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Drop lock entries nobody holds, so the lock table does not grow
    /// with every key ever seen.
    fn prune_locks(&self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    type Guard = MemoryGuard;

    async fn lock(&self, keys: &[StoreKey], timeout: Duration) -> Result<MemoryGuard> {
        let keys = lock_order(keys);
        let mut held = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.key_lock(key)?;
            match tokio::time::timeout(timeout, lock.lock_owned()).await {
                Ok(guard) => held.push(guard),
                Err(_) => return Err(StoreError::LockTimeout(key.clone())),
            }
        }
        Ok(MemoryGuard { keys, _held: held })
    }

    async fn read(&self, key: &StoreKey) -> Result<Option<Record>> {
        Ok(self.entries.read().await.get(key).map(|e| e.record))
    }

    async fn last_modified(&self, key: &StoreKey) -> Result<Option<i64>> {
        Ok(self.entries.read().await.get(key).map(|e| e.modified_at))
    }

    async fn write_atomic(&self, key: &StoreKey, record: Record, modified_at: i64) -> Result<()> {
        let guard = self.lock(std::slice::from_ref(key), self.lock_timeout).await?;
        self.transactional_accept(&guard, &[(key.clone(), record)], modified_at)
            .await
    }

    async fn transactional_accept(
        &self,
        guard: &MemoryGuard,
        updates: &[(StoreKey, Record)],
        modified_at: i64,
    ) -> Result<()> {
        ensure_covered(guard, updates)?;
        let mut entries = self.entries.write().await;
        for (key, record) in updates {
            entries.insert(
                key.clone(),
                Entry {
                    record: *record,
                    modified_at,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        let guard = self.lock(std::slice::from_ref(key), self.lock_timeout).await?;
        self.delete_locked(&guard, key).await
    }

    async fn delete_locked(&self, guard: &MemoryGuard, key: &StoreKey) -> Result<()> {
        if !guard.covers(key) {
            return Err(StoreError::NotLocked(key.clone()));
        }
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(StoreKey, i64)>> {
        self.prune_locks();
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.modified_at))
            .collect())
    }
}
