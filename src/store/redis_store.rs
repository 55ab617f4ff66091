//! Redis-backed counter store for multi-instance deployments.
//!
//! Records are JSON values under `{key_prefix}{key}` with a millisecond TTL.
//! Atomic updates are compare-and-swap: read the value (and any guard key) in
//! one `MGET`, apply the update locally, then write through a Lua script that
//! only succeeds if the value is still the one that was read. Conflicts retry
//! with jitter, and the whole update shares one timeout.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::{CounterStore, GuardedUpdateFn, StoreRecord, UpdateFn};
use crate::config::StoreConfig;
use crate::error::{Result, WardenError};

/// Writes ARGV[3] only if the key still holds ARGV[2] (ARGV[1] == '1') or is
/// still absent (ARGV[1] == '0'). The PX is ARGV[4] or the key's remaining
/// lifetime, whichever is longer.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
local px = tonumber(ARGV[4])
local remaining = redis.call('PTTL', KEYS[1])
if remaining > px then
    px = remaining
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', px)
return 1
"#;

const SCAN_BATCH: usize = 200;

pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    timeout: Duration,
    max_cas_retries: u32,
    cas_script: redis::Script,
}

impl RedisStore {
    /// Create a store. No connection is made until the first operation.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let url = config.redis_url.as_deref().ok_or_else(|| {
            WardenError::ConfigurationInvalid(
                "store.redis_url is required for the redis backend".to_string(),
            )
        })?;
        let client = redis::Client::open(url).map_err(|e| {
            WardenError::ConfigurationInvalid(format!("store.redis_url '{}': {}", url, e))
        })?;

        info!(
            key_prefix = %config.key_prefix,
            timeout_ms = config.timeout_ms,
            "Redis counter store configured"
        );

        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
            max_cas_retries: config.max_cas_retries.max(1),
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Run one Redis round trip under the operation timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => {
                result.map_err(|e| WardenError::StoreUnavailable(format!("{}: {}", op, e)))
            }
            Err(_) => Err(WardenError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                op,
                self.timeout.as_millis()
            ))),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = self
                    .bounded("CONNECT", ConnectionManager::new(self.client.clone()))
                    .await?;
                debug!("Connected to Redis");
                Ok::<_, WardenError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Both update operations, bounded as a whole by the store timeout.
    async fn compare_and_swap(
        &self,
        key: &str,
        guard_key: Option<&str>,
        ttl: Duration,
        update: &mut GuardedUpdateFn<'_>,
    ) -> Result<Option<StoreRecord>> {
        let attempts = self.cas_attempts(key, guard_key, ttl, update);
        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::StoreUnavailable(format!(
                "update of '{}' timed out after {}ms",
                key,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Each attempt reads `key` (and `guard_key`) with one `MGET`, then
    /// writes through the CAS script.
    async fn cas_attempts(
        &self,
        key: &str,
        guard_key: Option<&str>,
        ttl: Duration,
        update: &mut GuardedUpdateFn<'_>,
    ) -> Result<Option<StoreRecord>> {
        let full = self.full_key(key);
        let mut keys = vec![full.clone()];
        keys.extend(guard_key.map(|guard| self.full_key(guard)));
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.connection().await?;

        for attempt in 0..self.max_cas_retries {
            let mut values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|e| WardenError::StoreUnavailable(format!("MGET: {}", e)))?;
            values.resize(keys.len(), None);
            let raw = values[0].take();
            let current = raw.as_deref().and_then(|raw| self.decode(&full, raw));
            let guard = match values.get(1) {
                Some(Some(raw)) => self.decode(&keys[1], raw),
                _ => None,
            };

            let Some(record) = update(guard.as_ref(), current) else {
                return Ok(None);
            };
            let encoded = serde_json::to_string(&record)?;
            let (present, expected) = match raw.as_deref() {
                Some(value) => ("1", value),
                None => ("0", ""),
            };

            let swapped: i32 = self
                .cas_script
                .key(&full)
                .arg(present)
                .arg(expected)
                .arg(&encoded)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| WardenError::StoreUnavailable(format!("CAS: {}", e)))?;
            if swapped == 1 {
                return Ok(Some(record));
            }

            trace!(key = %full, attempt, "Compare-and-swap conflict, retrying");
            let jitter_ms = rand::thread_rng().gen_range(0..=1u64 << attempt.min(5));
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }

        warn!(key = %full, retries = self.max_cas_retries, "Giving up on contended update");
        Err(WardenError::StoreUnavailable(format!(
            "update of '{}' lost {} compare-and-swap races",
            key, self.max_cas_retries
        )))
    }

    fn decode(&self, key: &str, raw: &str) -> Option<StoreRecord> {
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable record");
                None
            }
        }
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        let full = self.full_key(key);
        let mut conn = self.connection().await?;
        let raw: Option<String> = self.bounded("GET", conn.get(&full)).await?;
        Ok(raw.and_then(|raw| self.decode(&full, &raw)))
    }

    async fn put(&self, key: &str, record: StoreRecord, ttl: Duration) -> Result<()> {
        let full = self.full_key(key);
        let encoded = serde_json::to_string(&record)?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded("PSETEX", conn.pset_ex(&full, encoded, ttl_ms))
            .await?;
        Ok(())
    }

    async fn atomic_update(
        &self,
        key: &str,
        ttl: Duration,
        update: &mut UpdateFn<'_>,
    ) -> Result<StoreRecord> {
        self.compare_and_swap(key, None, ttl, &mut |_, current| Some(update(current)))
            .await?
            .ok_or_else(|| WardenError::StoreUnavailable(format!("update of '{}' wrote nothing", key)))
    }

    async fn guarded_update(
        &self,
        key: &str,
        guard_key: &str,
        ttl: Duration,
        update: &mut GuardedUpdateFn<'_>,
    ) -> Result<Option<StoreRecord>> {
        self.compare_and_swap(key, Some(guard_key), ttl, update).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key);
        let mut conn = self.connection().await?;
        let removed: i64 = self.bounded("DEL", conn.del(&full)).await?;
        Ok(removed > 0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, StoreRecord)>> {
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let mut conn = self.connection().await?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .cursor_arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may repeat keys across batches.
        keys.sort();
        keys.dedup();

        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> = self
                .bounded("MGET", redis::cmd("MGET").arg(chunk).query_async(&mut conn))
                .await?;
            for (full, value) in chunk.iter().zip(values) {
                let (Some(value), Some(key)) = (value, full.strip_prefix(&self.key_prefix)) else {
                    continue;
                };
                if let Some(record) = self.decode(full, &value) {
                    records.push((key.to_string(), record));
                }
            }
        }
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
