//! The rate limiter context.
//!
//! [`RateLimiter`] owns every component and runs the per-request flow:
//! resolve the identity, pick the policy, short-circuit blocked identities,
//! evaluate the strategy, and record a violation on deny. Store failures are
//! turned into a decision here, so callers always get an answer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::key::{CounterKey, COUNTER_PREFIX};
use super::policy::{FailureMode, PolicyConfig, PolicyRegistry, UNCLASSIFIED};
use super::strategy::{Evaluation, LimitedBy, StrategyEngine};
use super::violation::ViolationTracker;
use crate::clock::{epoch_seconds, Clock, SystemClock};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::identity::{Identity, IdentityResolver};
use crate::monitor::{Monitor, MonitoringSnapshot, StatsScope, ViolationEvent};
use crate::store::{self, CounterStore};

/// Retry-after handed out when failing closed.
const STORE_FAILURE_RETRY_SECONDS: f64 = 1.0;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    /// Denied by the policy's main strategy
    RateLimited,
    /// Denied by the burst sub-check
    BurstLimited,
    /// The identity is serving a block
    Blocked,
    /// Allowed because the store was unavailable
    FailOpen,
    /// Denied because the store was unavailable
    StoreUnavailable,
}

/// The answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_seconds: f64,
    pub reason: DecisionReason,
}

impl Decision {
    fn denied(retry_after_seconds: f64, reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_seconds,
            reason,
        }
    }
}

/// The rate limiting engine.
///
/// Built once from configuration and shared as `Arc<RateLimiter>` across
/// request handlers.
pub struct RateLimiter {
    resolver: IdentityResolver,
    registry: PolicyRegistry,
    strategies: StrategyEngine,
    violations: ViolationTracker,
    monitor: Monitor,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl RateLimiter {
    /// Build a limiter over an explicit store and clock.
    ///
    /// Fails with `ConfigurationInvalid` if any section or policy is invalid.
    pub fn new(
        config: &WardenConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = IdentityResolver::new(&config.identity)?;
        let registry = PolicyRegistry::from_config(config)?;

        info!(
            store = store.name(),
            policies = config.policies.len(),
            "Rate limiter initialized"
        );

        Ok(Self {
            resolver,
            registry,
            strategies: StrategyEngine::new(store.clone(), config),
            violations: ViolationTracker::new(
                store.clone(),
                config.violations.decay_window_seconds,
            ),
            monitor: Monitor::new(config.monitoring.recent_violations),
            store,
            clock,
            sweep_interval: config.store.sweep_interval(),
        })
    }

    /// Build a limiter with the configured store backend and the system clock.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = store::from_config(&config.store, clock.clone())?;
        Self::new(config, store, clock)
    }

    /// Decide whether a request from `raw_address` to `endpoint_class` may
    /// proceed at `now`. Never fails.
    pub async fn evaluate_request(
        &self,
        raw_address: &str,
        endpoint_class: &str,
        now: DateTime<Utc>,
    ) -> Decision {
        let identity = self.resolver.resolve(raw_address);
        let scale = self.resolver.limit_scale(identity.trust);
        let base = self.registry.get_policy(endpoint_class);
        let policy = if scale == 1.0 {
            Cow::Borrowed(base)
        } else {
            Cow::Owned(base.scaled(scale))
        };

        let decision = match self.decide(&identity, endpoint_class, &policy, now).await {
            Ok(decision) => decision,
            Err(e) => self.store_failure(&identity, endpoint_class, &policy, e),
        };

        self.monitor
            .record_decision(self.stats_class(endpoint_class), decision.reason);
        decision
    }

    /// [`Self::evaluate_request`] at the current time.
    pub async fn check(&self, raw_address: &str, endpoint_class: &str) -> Decision {
        self.evaluate_request(raw_address, endpoint_class, self.clock.now())
            .await
    }

    async fn decide(
        &self,
        identity: &Identity,
        class: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let evaluation = self.strategies.evaluate(identity, class, policy, now).await?;
        if evaluation.allowed {
            return Ok(Decision {
                allowed: true,
                remaining: evaluation.remaining,
                retry_after_seconds: 0.0,
                reason: DecisionReason::Allowed,
            });
        }
        if evaluation.limited_by == Some(LimitedBy::Block) {
            debug!(
                identity = %identity,
                class = %class,
                retry_after = evaluation.retry_after_seconds,
                "Rejecting blocked identity"
            );
            return Ok(Decision::denied(
                evaluation.retry_after_seconds,
                DecisionReason::Blocked,
            ));
        }

        Ok(self.on_denied(identity, class, policy, evaluation, now).await)
    }

    /// Record the violation behind a denied evaluation. The denial stands even
    /// if the violation can't be recorded.
    async fn on_denied(
        &self,
        identity: &Identity,
        class: &str,
        policy: &PolicyConfig,
        evaluation: Evaluation,
        now: DateTime<Utc>,
    ) -> Decision {
        let reason = match evaluation.limited_by {
            Some(LimitedBy::Burst) => DecisionReason::BurstLimited,
            _ => DecisionReason::RateLimited,
        };
        let mut decision = Decision::denied(evaluation.retry_after_seconds, reason);

        let outcome = match self.violations.record_violation(identity, policy, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(identity = %identity, class = %class, error = %e, "Failed to record violation");
                return decision;
            }
        };

        if let Some(until) = outcome.blocked_until {
            decision.retry_after_seconds = decision.retry_after_seconds.max(seconds_until(now, until));
        }
        if outcome.block_applied {
            warn!(
                identity = %identity,
                class = %class,
                severity = ?policy.severity,
                block_seconds = policy.block_duration_seconds,
                "Violation threshold reached, identity blocked"
            );
        } else {
            debug!(
                identity = %identity,
                class = %class,
                reason = ?reason,
                violations = outcome.violation_count,
                "Request denied"
            );
        }

        self.monitor.record_violation(ViolationEvent {
            identity: identity.key.clone(),
            address: identity.address.map(|addr| addr.to_string()),
            endpoint_class: class.to_string(),
            at: now,
            reason,
            violation_count: outcome.violation_count,
            block_applied: outcome.block_applied,
        });
        decision
    }

    fn store_failure(
        &self,
        identity: &Identity,
        class: &str,
        policy: &PolicyConfig,
        error: WardenError,
    ) -> Decision {
        match policy.on_store_failure {
            FailureMode::Open => {
                warn!(identity = %identity, class = %class, error = %error, "Counter store unavailable, failing open");
                Decision {
                    allowed: true,
                    remaining: policy.limit,
                    retry_after_seconds: 0.0,
                    reason: DecisionReason::FailOpen,
                }
            }
            FailureMode::Closed => {
                warn!(identity = %identity, class = %class, error = %error, "Counter store unavailable, failing closed");
                Decision::denied(STORE_FAILURE_RETRY_SECONDS, DecisionReason::StoreUnavailable)
            }
        }
    }

    /// Statistics for classes without a policy are kept under `unclassified`.
    fn stats_class<'a>(&self, class: &'a str) -> &'a str {
        if self.registry.contains(class) {
            class
        } else {
            UNCLASSIFIED
        }
    }

    /// Lift the block on a client, given either its raw address or its
    /// identity key. Returns whether there was violation state to clear.
    pub async fn unblock(&self, raw_address_or_identity: &str) -> Result<bool> {
        let identity = self.resolver.resolve(raw_address_or_identity);
        let key = match identity.address {
            Some(_) => identity.key,
            None => raw_address_or_identity.trim().to_string(),
        };
        if key.is_empty() {
            return Ok(false);
        }
        self.violations.clear_block(&key).await
    }

    /// Reset decision statistics.
    pub fn reset_stats(&self, scope: StatsScope) {
        self.monitor.reset(&scope);
    }

    /// Current counters, blocks and recent violations.
    pub async fn snapshot(&self) -> Result<MonitoringSnapshot> {
        let now = self.clock.now();
        let (blocked, counters) = futures::try_join!(
            self.violations.active_blocks(now),
            self.store.scan(COUNTER_PREFIX)
        )?;

        let mut tracked_by_class: HashMap<String, usize> = HashMap::new();
        for (key, _) in counters {
            if let Some(key) = CounterKey::from_store_key(&key) {
                *tracked_by_class
                    .entry(self.stats_class(&key.class).to_string())
                    .or_default() += 1;
            }
        }

        debug!(
            at = epoch_seconds(now),
            blocked = blocked.len(),
            "Snapshot assembled"
        );
        Ok(self.monitor.snapshot(now, blocked, tracked_by_class))
    }

    /// Start the idle-record sweeper; it stops when `shutdown` turns true.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        store::spawn_sweeper(self.store.clone(), self.sweep_interval, shutdown)
    }
}

fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
    (epoch_seconds(until) - epoch_seconds(now)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_epoch_seconds, ManualClock};
    use crate::store::{MemoryStore, StoreRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CLIENT: &str = "203.0.113.7";

    struct Harness {
        limiter: Arc<RateLimiter>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn harness(yaml: &str) -> Harness {
        let config = WardenConfig::from_yaml(yaml).unwrap();
        let clock = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = RateLimiter::new(&config, store.clone(), clock.clone()).unwrap();
        Harness {
            limiter: Arc::new(limiter),
            clock,
            store,
        }
    }

    impl Harness {
        async fn at(&self, secs: f64, class: &str) -> Decision {
            self.from(CLIENT, secs, class).await
        }

        async fn from(&self, client: &str, secs: f64, class: &str) -> Decision {
            let now = from_epoch_seconds(secs);
            self.clock.set(now);
            self.limiter.evaluate_request(client, class, now).await
        }

        async fn allowed_of(&self, n: usize, secs: f64, class: &str) -> usize {
            let mut allowed = 0;
            for _ in 0..n {
                if self.at(secs, class).await.allowed {
                    allowed += 1;
                }
            }
            allowed
        }
    }

    #[tokio::test]
    async fn test_fixed_window_limit() {
        let h = harness(
            r#"
policies:
  login:
    limit: 5
    window_seconds: 60
    burst_limit: 5
    burst_window_seconds: 1
    strategy: fixed_window
"#,
        );

        for i in 0..5 {
            let decision = h.at(0.0, "login").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.reason, DecisionReason::Allowed);
        }

        let denied = h.at(0.0, "login").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::RateLimited);
        assert!((denied.retry_after_seconds - 60.0).abs() < 1e-6);

        assert!(h.at(61.0, "login").await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let h = harness(
            r#"
policies:
  api:
    limit: 60
    window_seconds: 60
    burst_limit: 10
    burst_window_seconds: 1
    strategy: token_bucket
"#,
        );

        assert_eq!(h.allowed_of(10, 100.0, "api").await, 10);

        let denied = h.at(100.0, "api").await;
        assert!(!denied.allowed);
        assert!((denied.retry_after_seconds - 1.0).abs() < 1e-6);

        assert_eq!(h.allowed_of(6, 105.0, "api").await, 5);
    }

    #[tokio::test]
    async fn test_sliding_window_smooths_boundary() {
        let h = harness(
            r#"
policies:
  search:
    limit: 10
    window_seconds: 60
    burst_limit: 10
    burst_window_seconds: 1
"#,
        );

        assert_eq!(h.allowed_of(10, 59.0, "search").await, 10);
        assert_eq!(h.allowed_of(10, 61.0, "search").await, 0);
    }

    #[tokio::test]
    async fn test_escalation_blocks_every_class() {
        let h = harness(
            r#"
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 60
    violation_threshold: 3
    block_duration_seconds: 300
  search:
    limit: 100
    window_seconds: 60
    burst_limit: 10
    burst_window_seconds: 1
"#,
        );

        assert!(h.at(0.0, "login").await.allowed);
        assert_eq!(h.at(1.0, "login").await.reason, DecisionReason::RateLimited);
        assert_eq!(h.at(2.0, "login").await.reason, DecisionReason::RateLimited);

        // Third denial applies the block.
        let third = h.at(3.0, "login").await;
        assert_eq!(third.reason, DecisionReason::RateLimited);
        assert!((third.retry_after_seconds - 300.0).abs() < 1e-6);

        let blocked = h.at(4.0, "search").await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.reason, DecisionReason::Blocked);
        assert!((blocked.retry_after_seconds - 299.0).abs() < 1e-6);

        assert!(h.at(304.0, "search").await.allowed);
        assert!(h.at(304.0, "login").await.allowed);
    }

    #[tokio::test]
    async fn test_unblock() {
        let h = harness(
            r#"
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 1
    violation_threshold: 1
    block_duration_seconds: 600
"#,
        );

        // Nothing to clear yet, and clearing creates nothing.
        assert!(!h.limiter.unblock(CLIENT).await.unwrap());
        assert!(!h.limiter.unblock(CLIENT).await.unwrap());

        assert!(h.at(0.0, "login").await.allowed);
        assert!(!h.at(1.0, "login").await.allowed);
        assert_eq!(h.at(2.0, "login").await.reason, DecisionReason::Blocked);

        assert!(h.limiter.unblock(CLIENT).await.unwrap());
        // Evaluated normally again: still over the window limit, but not blocked.
        let after = h.at(3.0, "login").await;
        assert_ne!(after.reason, DecisionReason::Blocked);

        h.limiter.unblock(CLIENT).await.unwrap();
        assert!(h.at(200.0, "login").await.allowed);
    }

    #[tokio::test]
    async fn test_unblock_by_identity_key() {
        let h = harness(
            r#"
identity:
  trust_private_ranges: false
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 1
    violation_threshold: 1
"#,
        );
        let client = "2001:db8:1:2::77";
        assert!(h.from(client, 0.0, "login").await.allowed);
        assert!(!h.from(client, 1.0, "login").await.allowed);
        assert_eq!(
            h.from(client, 2.0, "login").await.reason,
            DecisionReason::Blocked
        );

        assert!(h.limiter.unblock("2001:db8:1:2::/64").await.unwrap());
        assert_ne!(
            h.from(client, 3.0, "login").await.reason,
            DecisionReason::Blocked
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_one() {
        let h = harness(
            r#"
policies:
  checkout:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 1
"#,
        );
        let now = from_epoch_seconds(10.0);
        h.clock.set(now);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = h.limiter.clone();
                tokio::spawn(async move { limiter.evaluate_request(CLIENT, "checkout", now).await })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn test_unknown_class_uses_default_policy() {
        let h = harness("{}");

        assert_eq!(h.allowed_of(20, 0.0, "search").await, 20);
        let denied = h.at(0.0, "search").await;
        assert_eq!(denied.reason, DecisionReason::BurstLimited);

        let snapshot = h.limiter.snapshot().await.unwrap();
        assert_eq!(snapshot.classes["unclassified"].allowed, 20);
        assert_eq!(snapshot.classes["unclassified"].denied, 1);
        assert_eq!(snapshot.classes["unclassified"].tracked_counters, 1);
    }

    #[tokio::test]
    async fn test_trusted_identity_gets_scaled_limits() {
        let h = harness(
            r#"
policies:
  login:
    limit: 5
    window_seconds: 60
    burst_limit: 5
    burst_window_seconds: 1
    strategy: fixed_window
"#,
        );

        let mut allowed = 0;
        for _ in 0..12 {
            if h.from("10.0.0.8", 0.0, "login").await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_malformed_address_is_limited_more_strictly() {
        let h = harness(
            r#"
policies:
  login:
    limit: 4
    window_seconds: 60
    burst_limit: 4
    burst_window_seconds: 1
    strategy: fixed_window
"#,
        );

        let mut allowed = 0;
        for raw in ["garbage", "", "1.2.3", "also garbage"] {
            if h.from(raw, 0.0, "login").await.allowed {
                allowed += 1;
            }
        }
        // All share one key at half the limit.
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    async fn test_adaptive_tightens_and_recovers() {
        let h = harness(
            r#"
adaptive:
  risk_factor: 1.0
  decay:
    kind: linear
    per_second: 0.01
policies:
  api:
    limit: 10
    window_seconds: 10
    burst_limit: 10
    burst_window_seconds: 1
    strategy: adaptive
"#,
        );

        assert_eq!(h.allowed_of(11, 0.0, "api").await, 10);
        // risk 0.7 at t=30: ceil(10 / 1.7) = 6
        assert_eq!(h.allowed_of(7, 30.0, "api").await, 6);
        // risk fully decayed
        assert_eq!(h.allowed_of(11, 300.0, "api").await, 10);
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<StoreRecord>> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        async fn put(&self, _key: &str, _record: StoreRecord, _ttl: Duration) -> Result<()> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        async fn atomic_update(
            &self,
            _key: &str,
            _ttl: Duration,
            _update: &mut store::UpdateFn<'_>,
        ) -> Result<StoreRecord> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        async fn guarded_update(
            &self,
            _key: &str,
            _guard_key: &str,
            _ttl: Duration,
            _update: &mut store::GuardedUpdateFn<'_>,
        ) -> Result<Option<StoreRecord>> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        async fn remove(&self, _key: &str) -> Result<bool> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        async fn scan(&self, _prefix: &str) -> Result<Vec<(String, StoreRecord)>> {
            Err(WardenError::StoreUnavailable("down".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_failure_follows_severity() {
        let config = WardenConfig::from_yaml(
            r#"
policies:
  admin:
    limit: 10
    window_seconds: 60
    burst_limit: 2
    burst_window_seconds: 1
    severity: critical
"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let limiter = RateLimiter::new(&config, Arc::new(FailingStore), clock).unwrap();

        let admin = limiter.check(CLIENT, "admin").await;
        assert!(!admin.allowed);
        assert_eq!(admin.reason, DecisionReason::StoreUnavailable);
        assert_eq!(admin.retry_after_seconds, 1.0);

        let search = limiter.check(CLIENT, "search").await;
        assert!(search.allowed);
        assert_eq!(search.reason, DecisionReason::FailOpen);
        assert_eq!(search.remaining, 100);

        assert!(limiter.unblock(CLIENT).await.is_err());
        assert!(limiter.snapshot().await.is_err());
    }

    /// Counts store operations; each is one round trip on a networked store.
    struct CountingStore {
        inner: MemoryStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn tick(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
            self.tick();
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, record: StoreRecord, ttl: Duration) -> Result<()> {
            self.tick();
            self.inner.put(key, record, ttl).await
        }

        async fn atomic_update(
            &self,
            key: &str,
            ttl: Duration,
            update: &mut store::UpdateFn<'_>,
        ) -> Result<StoreRecord> {
            self.tick();
            self.inner.atomic_update(key, ttl, update).await
        }

        async fn guarded_update(
            &self,
            key: &str,
            guard_key: &str,
            ttl: Duration,
            update: &mut store::GuardedUpdateFn<'_>,
        ) -> Result<Option<StoreRecord>> {
            self.tick();
            self.inner.guarded_update(key, guard_key, ttl, update).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            self.tick();
            self.inner.remove(key).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<(String, StoreRecord)>> {
            self.tick();
            self.inner.scan(prefix).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_store_operations_per_decision() {
        let config = WardenConfig::from_yaml(
            r#"
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 1
    violation_threshold: 2
    block_duration_seconds: 60
"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(clock.clone()),
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::new(&config, store.clone(), clock.clone()).unwrap();
        let at = |secs: f64| from_epoch_seconds(secs);

        // Allowed: one guarded update covers the block check and the counter.
        assert!(limiter.evaluate_request(CLIENT, "login", at(0.0)).await.allowed);
        assert_eq!(store.calls(), 1);

        // Denied: plus one update of the violation record.
        let denied = limiter.evaluate_request(CLIENT, "login", at(1.0)).await;
        assert_eq!(denied.reason, DecisionReason::RateLimited);
        assert_eq!(store.calls(), 3);

        let blocking = limiter.evaluate_request(CLIENT, "login", at(2.0)).await;
        assert_eq!(blocking.reason, DecisionReason::RateLimited);
        assert_eq!(store.calls(), 5);

        // Blocked: the guard alone answers and nothing is written.
        let blocked = limiter.evaluate_request(CLIENT, "login", at(3.0)).await;
        assert_eq!(blocked.reason, DecisionReason::Blocked);
        assert!((blocked.retry_after_seconds - 59.0).abs() < 1e-6);
        assert_eq!(store.calls(), 6);
    }

    #[tokio::test]
    async fn test_idle_counters_expire_after_ttl() {
        let h = harness(
            r#"
policies:
  api:
    limit: 10
    window_seconds: 60
    burst_limit: 5
    burst_window_seconds: 1
  scoring:
    limit: 10
    window_seconds: 60
    burst_limit: 5
    burst_window_seconds: 1
    strategy: adaptive
"#,
        );
        let api = CounterKey::new(CLIENT, "api").to_store_key();
        let scoring = CounterKey::new(CLIENT, "scoring").to_store_key();

        assert!(h.at(0.0, "api").await.allowed);
        assert!(h.at(0.0, "scoring").await.allowed);

        // Idle TTL is 2 x 60s; adaptive records hold on for the 600s decay window.
        h.clock.set(from_epoch_seconds(121.0));
        assert_eq!(h.store.sweep_expired().await.unwrap(), 1);
        assert!(h.store.get(&api).await.unwrap().is_none());
        assert!(h.store.get(&scoring).await.unwrap().is_some());

        h.clock.set(from_epoch_seconds(599.0));
        assert_eq!(h.store.sweep_expired().await.unwrap(), 0);

        h.clock.set(from_epoch_seconds(601.0));
        assert_eq!(h.store.sweep_expired().await.unwrap(), 1);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_reset() {
        let h = harness(
            r#"
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 1
    burst_window_seconds: 1
    violation_threshold: 2
    block_duration_seconds: 120
"#,
        );

        h.at(0.0, "login").await;
        h.at(1.0, "login").await;
        h.at(2.0, "login").await;
        h.at(3.0, "login").await;

        let snapshot = h.limiter.snapshot().await.unwrap();
        let login = &snapshot.classes["login"];
        assert_eq!(login.allowed, 1);
        assert_eq!(login.denied, 3);
        assert_eq!(login.blocked, 1);
        assert_eq!(snapshot.tracked_counters, 1);

        assert_eq!(snapshot.blocked.len(), 1);
        assert_eq!(snapshot.blocked[0].identity, CLIENT);
        assert!((snapshot.blocked[0].remaining_seconds - 119.0).abs() < 1e-6);

        assert_eq!(snapshot.recent_violations.len(), 2);
        assert!(snapshot.recent_violations[1].block_applied);
        assert_eq!(snapshot.recent_violations[0].address.as_deref(), Some(CLIENT));

        h.limiter.reset_stats(StatsScope::Class("login".to_string()));
        let snapshot = h.limiter.snapshot().await.unwrap();
        assert_eq!(snapshot.classes["login"].allowed, 0);
        assert!(snapshot.recent_violations.is_empty());
        // Blocks are state, not statistics.
        assert_eq!(snapshot.blocked.len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WardenConfig::from_yaml(
            r#"
policies:
  login:
    limit: 1
    window_seconds: 60
    burst_limit: 5
    burst_window_seconds: 1
"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::at_epoch_seconds(0.0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        assert!(matches!(
            RateLimiter::new(&config, store.clone(), clock.clone()),
            Err(WardenError::ConfigurationInvalid(_))
        ));

        for field in ["window_seconds: .inf", "block_duration_seconds: 1.0e20"] {
            let window = if field.starts_with("window") {
                String::new()
            } else {
                "    window_seconds: 60\n".to_string()
            };
            let yaml = format!(
                "policies:\n  login:\n    limit: 5\n    burst_limit: 1\n    burst_window_seconds: 1\n{}    {}\n",
                window, field
            );
            let config = WardenConfig::from_yaml(&yaml).unwrap();
            assert!(
                matches!(
                    RateLimiter::new(&config, store.clone(), clock.clone()),
                    Err(WardenError::ConfigurationInvalid(_))
                ),
                "{field} should be rejected"
            );
        }
    }

    #[test]
    fn test_decision_serializes_reason() {
        let decision = Decision::denied(2.5, DecisionReason::BurstLimited);
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["reason"], "burst_limited");
        assert_eq!(json["allowed"], false);
    }
}
