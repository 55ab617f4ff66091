//! In-process counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{CounterStore, GuardedUpdateFn, StoreRecord, UpdateFn};
use crate::clock::Clock;
use crate::error::{Result, WardenError};

#[derive(Debug, Clone)]
struct Slot {
    record: StoreRecord,
    expires_at: DateTime<Utc>,
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A store backed by a sharded concurrent map.
///
/// Updates to one key run under that key's shard lock, which makes
/// [`CounterStore::atomic_update`] linearizable within the process. Expired
/// entries read as absent and are dropped by [`CounterStore::sweep_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the record at `key` with `update(current)` under the key's
    /// shard lock. `None` leaves the entry as it was.
    fn commit<F>(&self, key: &str, ttl: Duration, update: F) -> Option<StoreRecord>
    where
        F: FnOnce(Option<StoreRecord>) -> Option<StoreRecord>,
    {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);

        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = slot.is_live(now).then(|| slot.record.clone());
                let written = update(current);
                if let Some(record) = &written {
                    slot.record = record.clone();
                    slot.expires_at = slot.expires_at.max(expires_at);
                }
                written
            }
            Entry::Vacant(vacant) => {
                let written = update(None);
                if let Some(record) = &written {
                    vacant.insert(Slot {
                        record: record.clone(),
                        expires_at,
                    });
                }
                written
            }
        };

        trace!(key = %key, written = written.is_some(), "Updated record");
        written
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.clock.now() + ttl
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.record.clone()))
    }

    async fn put(&self, key: &str, record: StoreRecord, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.entries
            .insert(key.to_string(), Slot { record, expires_at });
        Ok(())
    }

    async fn atomic_update(
        &self,
        key: &str,
        ttl: Duration,
        update: &mut UpdateFn<'_>,
    ) -> Result<StoreRecord> {
        self.commit(key, ttl, |current| Some(update(current)))
            .ok_or_else(|| WardenError::StoreUnavailable(format!("update of '{}' wrote nothing", key)))
    }

    async fn guarded_update(
        &self,
        key: &str,
        guard_key: &str,
        ttl: Duration,
        update: &mut GuardedUpdateFn<'_>,
    ) -> Result<Option<StoreRecord>> {
        // Cloned out before `key` is locked; both may live in one shard.
        let guard = self.get(guard_key).await?;
        Ok(self.commit(key, ttl, |current| update(guard.as_ref(), current)))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, slot)| slot.is_live(now))
            .unwrap_or(false))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, StoreRecord)>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().record.clone()))
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        // An entry refreshed between the snapshot and here stays.
        let mut evicted = 0;
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, slot| !slot.is_live(now))
                .is_some()
            {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
