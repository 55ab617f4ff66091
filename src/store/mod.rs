//! Counter store abstraction.
//!
//! The engine keeps all per-identity state behind [`CounterStore`] so a single
//! process can run against an in-memory map while a fleet shares a Redis
//! cache. Every read-modify-write goes through [`CounterStore::atomic_update`];
//! concurrent evaluations of the same key must never lose an update.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::ratelimit::counter::CounterRecord;
use crate::ratelimit::violation::ViolationRecord;

/// A value held in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRecord {
    Counter(CounterRecord),
    Violation(ViolationRecord),
}

/// Update function handed to [`CounterStore::atomic_update`].
///
/// May be called more than once when the store retries after a conflict, so
/// it must derive its result from the value it is given and nothing else.
pub type UpdateFn<'a> = dyn FnMut(Option<StoreRecord>) -> StoreRecord + Send + 'a;

/// Update function handed to [`CounterStore::guarded_update`]: gets the
/// guard record and the current record, and returns the record to write or
/// `None` to leave the key untouched. Same retry rules as [`UpdateFn`].
pub type GuardedUpdateFn<'a> =
    dyn FnMut(Option<&StoreRecord>, Option<StoreRecord>) -> Option<StoreRecord> + Send + 'a;

/// Keyed storage for counter and violation records.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a record. Expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>>;

    /// Overwrite a record and reset its time to live.
    async fn put(&self, key: &str, record: StoreRecord, ttl: Duration) -> Result<()>;

    /// Atomically replace the record at `key` with `update(current)` and
    /// return what was written. The record lives at least `ttl` from now;
    /// a longer remaining lifetime is kept.
    async fn atomic_update(
        &self,
        key: &str,
        ttl: Duration,
        update: &mut UpdateFn<'_>,
    ) -> Result<StoreRecord>;

    /// Like [`CounterStore::atomic_update`], but `guard_key` is read in the
    /// same round trip as `key` and handed to `update`, which may decline to
    /// write. The guard is only read, never locked. Returns what was written.
    async fn guarded_update(
        &self,
        key: &str,
        guard_key: &str,
        ttl: Duration,
        update: &mut GuardedUpdateFn<'_>,
    ) -> Result<Option<StoreRecord>>;

    /// Delete a record, returning whether one existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// All live records whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, StoreRecord)>>;

    /// Drop expired records, returning how many went. Stores that expire
    /// records on their own have nothing to do.
    async fn sweep_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Open the configured store. Expiry in the in-process store follows `clock`.
pub fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(clock)),
        StoreBackend::Redis => Arc::new(RedisStore::new(config)?),
    };
    Ok(store)
}

/// Run [`CounterStore::sweep_expired`] every `every` until `shutdown` flips.
pub fn spawn_sweeper(
    store: Arc<dyn CounterStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(every));
        debug!(store = store.name(), interval_ms = every.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    match store.sweep_expired().await {
                        Ok(0) => {}
                        Ok(evicted) => debug!(store = store.name(), evicted, "Swept idle records"),
                        Err(e) => warn!(store = store.name(), error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(store = store.name(), "Sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::policy::Strategy;

    fn counter() -> StoreRecord {
        StoreRecord::Counter(CounterRecord::new(Strategy::FixedWindow, 1.0, 0.0))
    }

    #[test]
    fn test_record_is_tagged() {
        let json = serde_json::to_value(counter()).unwrap();
        assert_eq!(json["type"], "counter");
        assert_eq!(json["state"]["kind"], "fixed_window");

        let violation = StoreRecord::Violation(ViolationRecord::default());
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["type"], "violation");
    }

    #[test]
    fn test_from_config_picks_backend() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let memory = from_config(&StoreConfig::default(), clock.clone()).unwrap();
        assert_eq!(memory.name(), "memory");

        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            ..Default::default()
        };
        assert_eq!(from_config(&config, clock).unwrap().name(), "redis");
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let clock = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let store = Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
        store
            .put("counter|a|x", counter(), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .put("counter|b|x", counter(), Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
