//! Monitoring export.
//!
//! Keeps per-class decision counters and a bounded ring buffer of recent
//! violations, and assembles read-only snapshots for external display.
//! Nothing here feeds back into decisions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::ratelimit::violation::BlockEntry;
use crate::ratelimit::DecisionReason;

/// Which statistics to reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsScope {
    All,
    Class(String),
}

#[derive(Debug, Default)]
struct ClassCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    blocked: AtomicU64,
    fail_open: AtomicU64,
}

/// Decision counts for one endpoint class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassSnapshot {
    /// Requests let through, including fail-open ones
    pub allowed: u64,
    /// Requests rejected for any reason
    pub denied: u64,
    /// Rejections due to an active block
    pub blocked: u64,
    /// Requests let through because the store was unavailable
    pub fail_open: u64,
    /// Live counter records for this class
    pub tracked_counters: usize,
}

/// A denied evaluation that counted as a violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationEvent {
    pub identity: String,
    /// Parsed client address, when there was one
    pub address: Option<String>,
    pub endpoint_class: String,
    pub at: DateTime<Utc>,
    pub reason: DecisionReason,
    /// Count after this violation
    pub violation_count: u32,
    pub block_applied: bool,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub instance_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub classes: BTreeMap<String, ClassSnapshot>,
    pub blocked: Vec<BlockEntry>,
    /// Oldest first
    pub recent_violations: Vec<ViolationEvent>,
    pub tracked_counters: usize,
}

/// Collects statistics for snapshots.
#[derive(Debug)]
pub struct Monitor {
    instance_id: Uuid,
    classes: DashMap<String, ClassCounters>,
    recent: Mutex<VecDeque<ViolationEvent>>,
    capacity: usize,
}

impl Monitor {
    /// A monitor keeping at most `capacity` recent violations.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            instance_id: Uuid::new_v4(),
            classes: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Count one decision against `class`.
    pub fn record_decision(&self, class: &str, reason: DecisionReason) {
        let counters = self.classes.entry(class.to_string()).or_default();
        let bump = |counter: &AtomicU64| {
            counter.fetch_add(1, Ordering::Relaxed);
        };

        match reason {
            DecisionReason::Allowed => bump(&counters.allowed),
            DecisionReason::FailOpen => {
                bump(&counters.allowed);
                bump(&counters.fail_open);
            }
            DecisionReason::Blocked => {
                bump(&counters.denied);
                bump(&counters.blocked);
            }
            DecisionReason::RateLimited
            | DecisionReason::BurstLimited
            | DecisionReason::StoreUnavailable => bump(&counters.denied),
        }
    }

    /// Append a violation, evicting the oldest once full.
    pub fn record_violation(&self, event: ViolationEvent) {
        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    /// Reset counters and recent violations, for every class or just one.
    pub fn reset(&self, scope: &StatsScope) {
        match scope {
            StatsScope::All => {
                self.classes.clear();
                self.recent.lock().clear();
            }
            StatsScope::Class(class) => {
                self.classes.remove(class);
                self.recent
                    .lock()
                    .retain(|event| &event.endpoint_class != class);
            }
        }
        debug!(scope = ?scope, "Statistics reset");
    }

    /// Assemble a snapshot from the collected statistics plus the store-side
    /// views passed in.
    pub fn snapshot(
        &self,
        now: DateTime<Utc>,
        blocked: Vec<BlockEntry>,
        tracked_by_class: HashMap<String, usize>,
    ) -> MonitoringSnapshot {
        let mut classes: BTreeMap<String, ClassSnapshot> = self
            .classes
            .iter()
            .map(|entry| {
                let counters = entry.value();
                let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
                (
                    entry.key().clone(),
                    ClassSnapshot {
                        allowed: load(&counters.allowed),
                        denied: load(&counters.denied),
                        blocked: load(&counters.blocked),
                        fail_open: load(&counters.fail_open),
                        tracked_counters: 0,
                    },
                )
            })
            .collect();

        let tracked_counters: usize = tracked_by_class.values().sum();
        for (class, tracked) in tracked_by_class {
            classes.entry(class).or_default().tracked_counters = tracked;
        }

        MonitoringSnapshot {
            instance_id: self.instance_id,
            generated_at: now,
            classes,
            blocked,
            recent_violations: self.recent.lock().iter().cloned().collect(),
            tracked_counters,
        }
    }
}
