//! Rate limiting logic and state management.

pub mod counter;
pub mod key;
mod limiter;
pub mod policy;
pub mod strategy;
pub mod violation;

pub use limiter::{Decision, DecisionReason, RateLimiter};
pub use policy::{FailureMode, PolicyConfig, PolicyRegistry, PolicySpec, Severity, Strategy};
pub use strategy::StrategyEngine;
pub use violation::ViolationTracker;
