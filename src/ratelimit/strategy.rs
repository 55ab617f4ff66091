//! The strategy engine: one atomic evaluation of a request against a policy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::counter::{Check, CounterRecord, RiskDecay, StrategyState};
use super::key::{violation_key, CounterKey};
use super::policy::{PolicyConfig, Strategy};
use crate::clock::{epoch_seconds, ttl_from_seconds};
use crate::config::{RiskDecayConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::identity::Identity;
use crate::store::{CounterStore, StoreRecord};

/// Which check denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedBy {
    /// The policy's main strategy
    Strategy,
    /// The burst sub-check
    Burst,
    /// An active block on the identity; no counter was touched
    Block,
}

/// Outcome of a strategy evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_seconds: f64,
    /// Set when denied
    pub limited_by: Option<LimitedBy>,
}

/// Applies a policy's strategy and burst sub-check to stored counters.
pub struct StrategyEngine {
    store: Arc<dyn CounterStore>,
    risk_factor: f64,
    risk_decay: RiskDecay,
    /// Adaptive records outlive their windows so risk isn't forgotten early
    risk_horizon: f64,
    idle_ttl_multiplier: u32,
}

impl StrategyEngine {
    pub fn new(store: Arc<dyn CounterStore>, config: &WardenConfig) -> Self {
        let risk_decay = match config.adaptive.decay {
            RiskDecayConfig::Exponential { half_life_seconds } => RiskDecay::Exponential {
                half_life: half_life_seconds.unwrap_or(config.violations.decay_window_seconds),
            },
            RiskDecayConfig::Linear { per_second } => RiskDecay::Linear { per_second },
        };

        Self {
            store,
            risk_factor: config.adaptive.risk_factor,
            risk_decay,
            risk_horizon: config.violations.decay_window_seconds,
            idle_ttl_multiplier: config.store.idle_ttl_multiplier.max(1),
        }
    }

    /// Idle lifetime of a counter record.
    fn idle_ttl(&self, policy: &PolicyConfig) -> Duration {
        let longest = policy.window_seconds.max(policy.burst_window_seconds);
        let mut ttl = longest * self.idle_ttl_multiplier as f64;
        if policy.strategy == Strategy::Adaptive {
            ttl = ttl.max(self.risk_horizon);
        }
        ttl_from_seconds(ttl)
    }

    /// Evaluate one request from `identity` to `class` under `policy`.
    ///
    /// The read, the algorithm and the write happen in a single
    /// [`CounterStore::guarded_update`], so concurrent evaluations of the same
    /// key are linearizable. The identity's violation record rides along as
    /// the guard: while it holds an active block the counter is left alone
    /// and the evaluation is denied with [`LimitedBy::Block`].
    pub async fn evaluate(
        &self,
        identity: &Identity,
        class: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let now = epoch_seconds(now);
        let key = CounterKey::new(&identity.key, class);
        let store_key = key.to_store_key();
        let guard_key = violation_key(&identity.key);
        let mut evaluation = None;

        self.store
            .guarded_update(&store_key, &guard_key, self.idle_ttl(policy), &mut |guard, current| {
                if let Some(StoreRecord::Violation(violation)) = guard {
                    if let Some(until) = violation.blocked_until.filter(|until| *until > now) {
                        evaluation = Some(Evaluation {
                            allowed: false,
                            remaining: 0,
                            retry_after_seconds: until - now,
                            limited_by: Some(LimitedBy::Block),
                        });
                        return None;
                    }
                }

                let mut record = match current {
                    Some(StoreRecord::Counter(record))
                        if record.state.strategy() == policy.strategy =>
                    {
                        record
                    }
                    // Absent, or written under a different strategy.
                    _ => CounterRecord::new(policy.strategy, policy.burst_limit as f64, now),
                };
                evaluation = Some(self.apply(&mut record, policy, now));
                Some(StoreRecord::Counter(record))
            })
            .await?;

        let evaluation = evaluation.ok_or_else(|| {
            WardenError::StoreUnavailable(format!("no evaluation produced for {}", key))
        })?;

        trace!(
            key = %key,
            allowed = evaluation.allowed,
            remaining = evaluation.remaining,
            "Evaluated"
        );
        Ok(evaluation)
    }

    /// Run both checks against `record`, committing consumption only for an
    /// admitted request.
    fn apply(&self, record: &mut CounterRecord, policy: &PolicyConfig, now: f64) -> Evaluation {
        let limit = policy.limit;
        let window = policy.window_seconds;

        let main = match &mut record.state {
            StrategyState::FixedWindow(state) => state.hit(limit, window, now),
            StrategyState::SlidingWindow(state) => state.check(limit as f64, window, now),
            StrategyState::TokenBucket(state) => {
                state.check(policy.burst_limit as f64, policy.refill_rate(), now)
            }
            StrategyState::Adaptive(state) => state.check(
                limit as f64,
                self.risk_factor,
                &self.risk_decay,
                window,
                now,
            ),
        };
        let burst = record
            .burst
            .hit(policy.burst_limit, policy.burst_window_seconds, now);

        let allowed = main.allowed && burst.allowed;
        match &mut record.state {
            StrategyState::SlidingWindow(state) if allowed => state.admit(),
            StrategyState::TokenBucket(state) if allowed => state.admit(),
            StrategyState::Adaptive(state) if allowed => state.admit(),
            StrategyState::Adaptive(state) => state.penalize(),
            _ => {}
        }

        combine(main, burst)
    }
}

/// Deny wins; remaining is the tighter of the two and retry-after the longer
/// of the denying checks.
fn combine(main: Check, burst: Check) -> Evaluation {
    let allowed = main.allowed && burst.allowed;
    let limited_by = if !main.allowed {
        Some(LimitedBy::Strategy)
    } else if !burst.allowed {
        Some(LimitedBy::Burst)
    } else {
        None
    };

    let retry_after_seconds = [main, burst]
        .iter()
        .filter(|check| !check.allowed)
        .map(|check| check.retry_after)
        .fold(0.0, f64::max);

    Evaluation {
        allowed,
        remaining: if allowed {
            main.remaining.min(burst.remaining)
        } else {
            0
        },
        retry_after_seconds,
        limited_by,
    }
}
