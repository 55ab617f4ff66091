//! Violation tracking and temporary blocks.
//!
//! Every denied evaluation counts as a violation against the identity. Once
//! the count reaches the policy's threshold the identity is blocked for the
//! policy's block duration and the count starts over. A block applies to
//! every endpoint class, not just the one that triggered it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::{identity_from_violation_key, violation_key, VIOLATION_PREFIX};
use super::policy::PolicyConfig;
use crate::clock::{epoch_seconds, from_epoch_seconds, ttl_from_seconds};
use crate::error::Result;
use crate::identity::Identity;
use crate::store::{CounterStore, StoreRecord};

/// Violation state for one identity. Times are epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Violations since the last block or decay reset
    pub violation_count: u32,
    pub last_violation_time: Option<f64>,
    pub blocked_until: Option<f64>,
    /// Lifetime violations, never reset
    #[serde(default)]
    pub total_violations: u64,
    /// Lifetime blocks applied
    #[serde(default)]
    pub blocks_applied: u32,
}

impl ViolationRecord {
    /// Whether a block is in force at `now`.
    pub fn is_blocked(&self, now: f64) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// A currently blocked identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockEntry {
    pub identity: String,
    pub blocked_until: DateTime<Utc>,
    pub remaining_seconds: f64,
}

/// Result of recording one violation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViolationOutcome {
    /// Whether this violation triggered a new block
    pub block_applied: bool,
    /// Count after this violation; zero when a block was applied
    pub violation_count: u32,
    /// Block end, if the identity is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Records violations and decides blocks.
pub struct ViolationTracker {
    store: Arc<dyn CounterStore>,
    decay_window: f64,
}

impl ViolationTracker {
    pub fn new(store: Arc<dyn CounterStore>, decay_window_seconds: f64) -> Self {
        Self {
            store,
            decay_window: decay_window_seconds,
        }
    }

    /// Keep the record while a violation can still count or a block holds.
    /// The store never shortens a lifetime, so a longer earlier block keeps
    /// its record alive.
    fn ttl(&self, policy: &PolicyConfig) -> Duration {
        ttl_from_seconds(self.decay_window.max(policy.block_duration_seconds) + 1.0)
    }

    /// End of the block in force for `identity`, if any.
    pub async fn blocked_until(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = epoch_seconds(now);
        match self.store.get(&violation_key(&identity.key)).await? {
            Some(StoreRecord::Violation(record)) if record.is_blocked(now) => {
                Ok(record.blocked_until.map(from_epoch_seconds))
            }
            _ => Ok(None),
        }
    }

    /// Whether `identity` is blocked at `now`.
    pub async fn check_blocked(&self, identity: &Identity, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.blocked_until(identity, now).await?.is_some())
    }

    /// Count a violation and block the identity once the policy's threshold
    /// is reached.
    pub async fn record_violation(
        &self,
        identity: &Identity,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<ViolationOutcome> {
        let now = epoch_seconds(now);
        let key = violation_key(&identity.key);
        let mut block_applied = false;

        let written = self
            .store
            .atomic_update(&key, self.ttl(policy), &mut |current| {
                let mut record = match current {
                    Some(StoreRecord::Violation(record)) => record,
                    _ => ViolationRecord::default(),
                };
                block_applied = false;

                if record.blocked_until.is_some_and(|until| until <= now) {
                    record.blocked_until = None;
                }
                let decayed = record
                    .last_violation_time
                    .is_some_and(|last| now - last >= self.decay_window);
                if decayed {
                    record.violation_count = 0;
                }

                record.violation_count += 1;
                record.total_violations += 1;
                record.last_violation_time = Some(now);

                if record.violation_count >= policy.violation_threshold {
                    let until = now + policy.block_duration_seconds;
                    record.blocked_until =
                        Some(record.blocked_until.map_or(until, |existing| existing.max(until)));
                    record.violation_count = 0;
                    record.blocks_applied += 1;
                    block_applied = true;
                }

                StoreRecord::Violation(record)
            })
            .await?;

        let StoreRecord::Violation(record) = written else {
            return Ok(ViolationOutcome {
                block_applied: false,
                violation_count: 0,
                blocked_until: None,
            });
        };

        if block_applied {
            debug!(
                identity = %identity,
                blocks_applied = record.blocks_applied,
                "Violation threshold reached"
            );
        }

        Ok(ViolationOutcome {
            block_applied,
            violation_count: record.violation_count,
            blocked_until: record
                .blocked_until
                .filter(|until| *until > now)
                .map(from_epoch_seconds),
        })
    }

    /// Lift any block on the identity with this key and clear its count.
    ///
    /// Returns whether there was a record to clear. An identity with no
    /// record is left without one.
    pub async fn clear_block(&self, identity_key: &str) -> Result<bool> {
        let key = violation_key(identity_key);
        if self.store.get(&key).await?.is_none() {
            debug!(identity = %identity_key, "No violation state to clear");
            return Ok(false);
        }

        let decay = ttl_from_seconds(self.decay_window + 1.0);
        let written = self
            .store
            .atomic_update(&key, decay, &mut |current| {
                let mut record = match current {
                    Some(StoreRecord::Violation(record)) => record,
                    _ => ViolationRecord::default(),
                };
                record.blocked_until = None;
                record.violation_count = 0;
                StoreRecord::Violation(record)
            })
            .await?;

        info!(identity = %identity_key, "Block cleared");
        Ok(matches!(written, StoreRecord::Violation(_)))
    }

    /// All identities blocked at `now`, soonest expiry first.
    pub async fn active_blocks(&self, now: DateTime<Utc>) -> Result<Vec<BlockEntry>> {
        let now_secs = epoch_seconds(now);
        let mut blocks: Vec<BlockEntry> = self
            .store
            .scan(VIOLATION_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, record)| {
                let StoreRecord::Violation(record) = record else {
                    warn!(key = %key, "Unexpected record under violation prefix");
                    return None;
                };
                let until = record.blocked_until.filter(|until| *until > now_secs)?;
                Some(BlockEntry {
                    identity: identity_from_violation_key(&key)?.to_string(),
                    blocked_until: from_epoch_seconds(until),
                    remaining_seconds: until - now_secs,
                })
            })
            .collect();

        blocks.sort_by(|a, b| a.blocked_until.cmp(&b.blocked_until));
        Ok(blocks)
    }
}
