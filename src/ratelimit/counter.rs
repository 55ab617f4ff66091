//! Per-key counter state for each rate limiting algorithm.
//!
//! Everything here is plain data plus arithmetic on fractional epoch seconds.
//! Nothing touches a store or a clock, so the algorithms can be exercised with
//! hand-picked timestamps.

use serde::{Deserialize, Serialize};

use super::policy::Strategy;

/// Tolerance for floating point comparisons against whole request counts.
const EPSILON: f64 = 1e-9;

/// The outcome of checking one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Check {
    /// Whether the request fits within this limiter
    pub allowed: bool,
    /// Requests left after this one, zero when denied
    pub remaining: u64,
    /// Seconds until a request would be admitted, zero when allowed
    pub retry_after: f64,
}

/// Start of the epoch-aligned window containing `now`.
fn aligned_start(now: f64, window: f64) -> f64 {
    (now / window).floor() * window
}

/// Fixed window counter aligned to the epoch.
///
/// Every hit counts, admitted or not. The count resets sharply at the window
/// boundary, so a client can land `2 * limit` requests around it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowState {
    /// When the current window started
    pub window_start: f64,
    /// Hits seen in the current window
    pub count: u64,
}

impl FixedWindowState {
    /// Record a hit and check it against `limit`.
    pub fn hit(&mut self, limit: u64, window: f64, now: f64) -> Check {
        let start = aligned_start(now, window);
        if start > self.window_start {
            self.window_start = start;
            self.count = 0;
        }

        self.count += 1;
        let allowed = self.count <= limit;

        Check {
            allowed,
            remaining: limit.saturating_sub(self.count),
            retry_after: if allowed {
                0.0
            } else {
                (self.window_start + window - now).max(0.0)
            },
        }
    }
}

/// Sliding window approximated from two adjacent fixed windows.
///
/// The trailing count is `current + previous * (1 - progress)`, which assumes
/// the previous window's requests were spread evenly. The error against an
/// exact log is bounded by the previous window's count times the overlap
/// fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    /// Start of the current fixed window
    pub current_start: f64,
    /// Admitted requests in the current window
    pub current_count: u64,
    /// Admitted requests in the window before it
    pub previous_count: u64,
}

impl SlidingWindowState {
    fn rotate(&mut self, window: f64, now: f64) {
        let start = aligned_start(now, window);
        if start <= self.current_start {
            return;
        }

        // More than one window went by: the old counts no longer overlap.
        self.previous_count = if start - self.current_start > window * 1.5 {
            0
        } else {
            self.current_count
        };
        self.current_count = 0;
        self.current_start = start;
    }

    /// Weighted request count over the trailing window ending at `now`.
    pub fn estimate(&self, window: f64, now: f64) -> f64 {
        let progress = ((now - self.current_start) / window).clamp(0.0, 1.0);
        self.current_count as f64 + self.previous_count as f64 * (1.0 - progress)
    }

    /// Check whether one more request fits under `limit`. Does not record it.
    pub fn check(&mut self, limit: f64, window: f64, now: f64) -> Check {
        self.rotate(window, now);
        let estimate = self.estimate(window, now);
        let allowed = estimate + 1.0 <= limit + EPSILON;

        Check {
            allowed,
            remaining: if allowed {
                (limit - estimate - 1.0 + EPSILON).floor().max(0.0) as u64
            } else {
                0
            },
            retry_after: if allowed {
                0.0
            } else {
                self.retry_after(limit, window, now)
            },
        }
    }

    /// Record an admitted request.
    pub fn admit(&mut self) {
        self.current_count += 1;
    }

    /// Time until the weighted count drops far enough for one more request.
    fn retry_after(&self, limit: f64, window: f64, now: f64) -> f64 {
        let current = self.current_count as f64;
        let previous = self.previous_count as f64;

        let at = if current + 1.0 <= limit + EPSILON && previous > 0.0 {
            // Wait for the previous window's weight to bleed off.
            let progress = 1.0 - (limit - current - 1.0) / previous;
            self.current_start + progress * window
        } else if current > 0.0 {
            // The current window alone is full; it becomes "previous" next.
            let progress = (1.0 - (limit - 1.0) / current).max(0.0);
            self.current_start + window + progress * window
        } else {
            self.current_start + window
        };

        (at - now).max(0.0)
    }
}

/// Token bucket holding up to `capacity` tokens, refilled continuously.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens currently available
    pub tokens: f64,
    /// When tokens were last added
    pub last_refill: f64,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then check for a whole token. Does not consume it.
    pub fn check(&mut self, capacity: f64, rate: f64, now: f64) -> Check {
        self.refill(capacity, rate, now);
        let allowed = self.tokens + EPSILON >= 1.0;

        Check {
            allowed,
            remaining: if allowed {
                (self.tokens - 1.0 + EPSILON).floor().max(0.0) as u64
            } else {
                0
            },
            retry_after: if allowed {
                0.0
            } else {
                (1.0 - self.tokens) / rate
            },
        }
    }

    /// Consume one token.
    pub fn admit(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

/// How the adaptive risk score decays without new violations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskDecay {
    /// Halves every `half_life` seconds
    Exponential { half_life: f64 },
    /// Loses `per_second` every second, never below zero
    Linear { per_second: f64 },
}

impl RiskDecay {
    /// Score after `elapsed` seconds of decay.
    pub fn apply(&self, score: f64, elapsed: f64) -> f64 {
        if elapsed <= 0.0 {
            return score;
        }
        match *self {
            RiskDecay::Exponential { half_life } => score * 0.5f64.powf(elapsed / half_life),
            RiskDecay::Linear { per_second } => (score - per_second * elapsed).max(0.0),
        }
    }
}

/// Sliding window whose limit shrinks as the key's risk score grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveState {
    /// Underlying sliding window
    pub window: SlidingWindowState,
    /// Accumulated risk from denied requests
    pub risk_score: f64,
    /// When `risk_score` was last decayed
    pub risk_updated: f64,
}

impl AdaptiveState {
    /// Fresh state with no accumulated risk.
    pub fn new(now: f64) -> Self {
        Self {
            risk_updated: now,
            ..Default::default()
        }
    }

    fn decay(&mut self, decay: &RiskDecay, now: f64) {
        if now > self.risk_updated {
            self.risk_score = decay.apply(self.risk_score, now - self.risk_updated);
            self.risk_updated = now;
        }
    }

    /// `limit / (1 + risk * k)`, rounded up and never below one request.
    ///
    /// Rounding up keeps a fully decayed score from costing a whole request
    /// through floating point residue.
    pub fn effective_limit(&self, limit: f64, risk_factor: f64) -> f64 {
        (limit / (1.0 + self.risk_score * risk_factor)).ceil().max(1.0)
    }

    /// Decay the risk, then check the sliding window against the scaled limit.
    pub fn check(
        &mut self,
        limit: f64,
        risk_factor: f64,
        decay: &RiskDecay,
        window: f64,
        now: f64,
    ) -> Check {
        self.decay(decay, now);
        let effective = self.effective_limit(limit, risk_factor);
        self.window.check(effective, window, now)
    }

    /// Record an admitted request.
    pub fn admit(&mut self) {
        self.window.admit();
    }

    /// Raise the risk after a denied request.
    pub fn penalize(&mut self) {
        self.risk_score += 1.0;
    }
}

/// Algorithm-specific state, tagged by strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
    TokenBucket(TokenBucketState),
    Adaptive(AdaptiveState),
}

impl StrategyState {
    /// Fresh state for `strategy`, with a token bucket starting full.
    pub fn new(strategy: Strategy, bucket_capacity: f64, now: f64) -> Self {
        match strategy {
            Strategy::FixedWindow => StrategyState::FixedWindow(FixedWindowState::default()),
            Strategy::SlidingWindow => StrategyState::SlidingWindow(SlidingWindowState::default()),
            Strategy::TokenBucket => {
                StrategyState::TokenBucket(TokenBucketState::new(bucket_capacity, now))
            }
            Strategy::Adaptive => StrategyState::Adaptive(AdaptiveState::new(now)),
        }
    }

    /// The strategy this state belongs to.
    pub fn strategy(&self) -> Strategy {
        match self {
            StrategyState::FixedWindow(_) => Strategy::FixedWindow,
            StrategyState::SlidingWindow(_) => Strategy::SlidingWindow,
            StrategyState::TokenBucket(_) => Strategy::TokenBucket,
            StrategyState::Adaptive(_) => Strategy::Adaptive,
        }
    }
}

/// Everything stored for one (identity, endpoint class) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Main strategy state
    pub state: StrategyState,
    /// Short burst window, always a fixed window
    pub burst: FixedWindowState,
}

impl CounterRecord {
    /// Fresh record for `strategy`.
    pub fn new(strategy: Strategy, bucket_capacity: f64, now: f64) -> Self {
        Self {
            state: StrategyState::new(strategy, bucket_capacity, now),
            burst: FixedWindowState::default(),
        }
    }
}
