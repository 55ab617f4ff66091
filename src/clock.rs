//! Time sources.
//!
//! The engine takes explicit timestamps on its hot path, but the in-process
//! store and the sweeper need a notion of "now" of their own. Both read it
//! through [`Clock`] so tests can drive time by hand.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at `secs` seconds after the Unix epoch.
    pub fn at_epoch_seconds(secs: f64) -> Self {
        Self::new(from_epoch_seconds(secs))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock();
        *now += Duration::from_std(by).unwrap_or(Duration::zero());
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fractional seconds since the Unix epoch.
///
/// Records store time in this form so they serialize compactly and so the
/// window arithmetic stays in plain floating point.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Longest span accepted anywhere a duration is configured: ten years.
pub const MAX_DURATION_SECONDS: f64 = 10.0 * 365.0 * 86_400.0;

/// Whether `secs` is a usable configured duration: finite, positive and no
/// longer than [`MAX_DURATION_SECONDS`].
pub fn is_valid_duration(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_DURATION_SECONDS
}

/// Convert seconds to a store TTL, clamped to `0..=MAX_DURATION_SECONDS`.
/// Never panics; NaN maps to the maximum.
pub fn ttl_from_seconds(secs: f64) -> std::time::Duration {
    let max = std::time::Duration::from_secs(MAX_DURATION_SECONDS as u64);
    std::time::Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECONDS)).unwrap_or(max)
}

/// Inverse of [`epoch_seconds`].
pub fn from_epoch_seconds(secs: f64) -> DateTime<Utc> {
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds_conversion() {
        let at = from_epoch_seconds(1_700_000_000.25);
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert!((epoch_seconds(at) - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_epoch_seconds(100.0);
        clock.advance(std::time::Duration::from_millis(1500));
        assert!((epoch_seconds(clock.now()) - 101.5).abs() < 1e-6);

        clock.set(from_epoch_seconds(10.0));
        assert_eq!(clock.now().timestamp(), 10);
    }

    #[test]
    fn test_duration_bounds() {
        assert!(is_valid_duration(60.0));
        assert!(is_valid_duration(MAX_DURATION_SECONDS));
        assert!(!is_valid_duration(0.0));
        assert!(!is_valid_duration(f64::INFINITY));
        assert!(!is_valid_duration(f64::NAN));
        assert!(!is_valid_duration(1.0e20));
    }

    #[test]
    fn test_ttl_from_seconds_clamps() {
        let max = std::time::Duration::from_secs(MAX_DURATION_SECONDS as u64);
        assert_eq!(ttl_from_seconds(1.5), std::time::Duration::from_millis(1500));
        assert_eq!(ttl_from_seconds(-3.0), std::time::Duration::ZERO);
        assert_eq!(ttl_from_seconds(f64::INFINITY), max);
        assert_eq!(ttl_from_seconds(1.0e20), max);
        assert_eq!(ttl_from_seconds(f64::NAN), max);
    }
}
