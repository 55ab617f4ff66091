//! Rate limit policies and the registry that maps endpoint classes to them.
//!
//! Policies are read once from configuration. A class without an entry falls
//! back to the `unclassified` default rather than being rejected.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::clock::{is_valid_duration, MAX_DURATION_SECONDS};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};

/// Name under which the fallback policy is reported.
pub const UNCLASSIFIED: &str = "unclassified";

/// How serious abuse of an endpoint class is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Violations before a block, when the policy doesn't say.
    pub fn default_violation_threshold(&self) -> u32 {
        match self {
            Severity::Low => 10,
            Severity::Medium => 5,
            Severity::High => 3,
            Severity::Critical => 3,
        }
    }

    /// Block length in seconds, when the policy doesn't say.
    pub fn default_block_duration(&self) -> f64 {
        match self {
            Severity::Low => 300.0,
            Severity::Medium => 900.0,
            Severity::High => 3600.0,
            Severity::Critical => 86400.0,
        }
    }

    /// Behaviour when the counter store is unreachable.
    pub fn default_failure_mode(&self) -> FailureMode {
        match self {
            Severity::Critical => FailureMode::Closed,
            _ => FailureMode::Open,
        }
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FixedWindow,
    #[default]
    SlidingWindow,
    TokenBucket,
    Adaptive,
}

/// What to decide when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through
    Open,
    /// Reject the request
    Closed,
}

/// A policy as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Maximum requests per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: f64,
    /// Maximum requests per burst window
    pub burst_limit: u64,
    /// Burst window length in seconds
    pub burst_window_seconds: f64,
    /// Violations before a block; defaults from severity
    #[serde(default)]
    pub violation_threshold: Option<u32>,
    /// Block length in seconds; defaults from severity
    #[serde(default)]
    pub block_duration_seconds: Option<f64>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub strategy: Strategy,
    /// Store failure behaviour; defaults from severity
    #[serde(default)]
    pub on_store_failure: Option<FailureMode>,
}

/// A fully resolved, validated policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyConfig {
    pub limit: u64,
    pub window_seconds: f64,
    pub burst_limit: u64,
    pub burst_window_seconds: f64,
    pub violation_threshold: u32,
    pub block_duration_seconds: f64,
    pub severity: Severity,
    pub strategy: Strategy,
    pub on_store_failure: FailureMode,
}

impl PolicyConfig {
    /// Fill severity defaults into a [`PolicySpec`] and check the invariants.
    pub fn resolve(class: &str, spec: &PolicySpec) -> Result<Self> {
        let policy = Self {
            limit: spec.limit,
            window_seconds: spec.window_seconds,
            burst_limit: spec.burst_limit,
            burst_window_seconds: spec.burst_window_seconds,
            violation_threshold: spec
                .violation_threshold
                .unwrap_or_else(|| spec.severity.default_violation_threshold()),
            block_duration_seconds: spec
                .block_duration_seconds
                .unwrap_or_else(|| spec.severity.default_block_duration()),
            severity: spec.severity,
            strategy: spec.strategy,
            on_store_failure: spec
                .on_store_failure
                .unwrap_or_else(|| spec.severity.default_failure_mode()),
        };
        policy.validate(class)?;
        Ok(policy)
    }

    /// Conservative fallback for endpoint classes without a policy.
    pub fn unclassified() -> Self {
        let severity = Severity::Low;
        Self {
            limit: 100,
            window_seconds: 60.0,
            burst_limit: 20,
            burst_window_seconds: 1.0,
            violation_threshold: severity.default_violation_threshold(),
            block_duration_seconds: severity.default_block_duration(),
            severity,
            strategy: Strategy::SlidingWindow,
            on_store_failure: severity.default_failure_mode(),
        }
    }

    /// Check the policy invariants.
    pub fn validate(&self, class: &str) -> Result<()> {
        let fail = |reason: String| {
            Err(WardenError::ConfigurationInvalid(format!(
                "policy '{}': {}",
                class, reason
            )))
        };

        if class.trim().is_empty() {
            return fail("endpoint class name is empty".to_string());
        }
        if self.limit == 0 {
            return fail("limit must be positive".to_string());
        }
        if self.burst_limit == 0 {
            return fail("burst_limit must be positive".to_string());
        }
        if self.burst_limit > self.limit {
            return fail(format!(
                "burst_limit ({}) exceeds limit ({})",
                self.burst_limit, self.limit
            ));
        }
        if !is_valid_duration(self.window_seconds) {
            return fail(format!(
                "window_seconds must be positive, finite and at most {}s",
                MAX_DURATION_SECONDS
            ));
        }
        if !is_valid_duration(self.burst_window_seconds) {
            return fail(format!(
                "burst_window_seconds must be positive, finite and at most {}s",
                MAX_DURATION_SECONDS
            ));
        }
        if self.violation_threshold == 0 {
            return fail("violation_threshold must be positive".to_string());
        }
        if !is_valid_duration(self.block_duration_seconds) {
            return fail(format!(
                "block_duration_seconds must be positive, finite and at most {}s",
                MAX_DURATION_SECONDS
            ));
        }
        Ok(())
    }

    /// Tokens per second for the token bucket strategy.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window_seconds
    }

    /// Copy of this policy with both limits scaled, each kept at one or more.
    pub fn scaled(&self, factor: f64) -> Self {
        if factor == 1.0 {
            return self.clone();
        }
        let scale = |value: u64| ((value as f64 * factor).floor() as u64).max(1);
        Self {
            limit: scale(self.limit),
            burst_limit: scale(self.burst_limit),
            ..self.clone()
        }
    }
}

/// Unknown class names remembered for warn-once logging. Class names come
/// from callers, so the set is capped; later misses only log at debug.
const MAX_REPORTED_UNKNOWN: usize = 1024;

/// Maps endpoint classes to their policies.
///
/// Immutable after construction apart from the bounded set of classes
/// already reported as unknown, which only feeds logging.
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: HashMap<String, PolicyConfig>,
    default: PolicyConfig,
    reported_unknown: DashMap<String, ()>,
}

impl PolicyRegistry {
    /// Build the registry from configuration, rejecting invalid policies.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let default = match &config.default_policy {
            Some(spec) => PolicyConfig::resolve(UNCLASSIFIED, spec)?,
            None => PolicyConfig::unclassified(),
        };

        let mut policies = HashMap::with_capacity(config.policies.len());
        for (class, spec) in &config.policies {
            let policy = PolicyConfig::resolve(class, spec)?;
            debug!(
                class = %class,
                limit = policy.limit,
                window = policy.window_seconds,
                strategy = ?policy.strategy,
                severity = ?policy.severity,
                "Loaded policy"
            );
            policies.insert(class.clone(), policy);
        }

        info!(policies = policies.len(), "Policy registry ready");

        Ok(Self {
            policies,
            default,
            reported_unknown: DashMap::new(),
        })
    }

    /// Policy for `class`, or the default when there is none.
    pub fn get_policy(&self, class: &str) -> &PolicyConfig {
        if let Some(policy) = self.policies.get(class) {
            return policy;
        }

        let first_miss = !self.reported_unknown.contains_key(class)
            && self.reported_unknown.len() < MAX_REPORTED_UNKNOWN
            && self.reported_unknown.insert(class.to_string(), ()).is_none();
        if first_miss {
            warn!(class = %class, "Unknown endpoint class, applying default policy");
        } else {
            debug!(class = %class, "Unknown endpoint class, applying default policy");
        }
        &self.default
    }

    /// Whether `class` has an explicit policy.
    pub fn contains(&self, class: &str) -> bool {
        self.policies.contains_key(class)
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> &PolicyConfig {
        &self.default
    }

    /// Explicit policies, sorted by class name.
    pub fn policies(&self) -> Vec<(&str, &PolicyConfig)> {
        let mut entries: Vec<_> = self
            .policies
            .iter()
            .map(|(class, policy)| (class.as_str(), policy))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(yaml: &str) -> Result<PolicyRegistry> {
        PolicyRegistry::from_config(&WardenConfig::from_yaml(yaml)?)
    }

    #[test]
    fn test_parse_policies() {
        let registry = registry(
            r#"
policies:
  login:
    limit: 5
    window_seconds: 60
    burst_limit: 3
    burst_window_seconds: 1
    severity: high
    strategy: fixed_window
  upload:
    limit: 20
    window_seconds: 3600
    burst_limit: 5
    burst_window_seconds: 10
    violation_threshold: 7
    block_duration_seconds: 120
    strategy: token_bucket
"#,
        )
        .unwrap();

        let login = registry.get_policy("login");
        assert_eq!(login.limit, 5);
        assert_eq!(login.strategy, Strategy::FixedWindow);
        assert_eq!(login.violation_threshold, 3);
        assert_eq!(login.block_duration_seconds, 3600.0);
        assert_eq!(login.on_store_failure, FailureMode::Open);

        let upload = registry.get_policy("upload");
        assert_eq!(upload.severity, Severity::Low);
        assert_eq!(upload.violation_threshold, 7);
        assert_eq!(upload.block_duration_seconds, 120.0);
        assert_eq!(upload.strategy, Strategy::TokenBucket);
    }

    #[test]
    fn test_critical_defaults_to_fail_closed() {
        let registry = registry(
            r#"
policies:
  admin:
    limit: 10
    window_seconds: 60
    burst_limit: 2
    burst_window_seconds: 1
    severity: critical
  admin_relaxed:
    limit: 10
    window_seconds: 60
    burst_limit: 2
    burst_window_seconds: 1
    severity: critical
    on_store_failure: open
"#,
        )
        .unwrap();

        assert_eq!(registry.get_policy("admin").on_store_failure, FailureMode::Closed);
        assert_eq!(
            registry.get_policy("admin_relaxed").on_store_failure,
            FailureMode::Open
        );
    }

    #[test]
    fn test_unknown_class_uses_default() {
        let registry = registry("{}").unwrap();
        assert!(!registry.contains("search"));

        let policy = registry.get_policy("search");
        assert_eq!(policy, &PolicyConfig::unclassified());
        assert_eq!(policy.severity, Severity::Low);

        // Second lookup takes the quiet path and still succeeds.
        assert_eq!(registry.get_policy("search"), registry.default_policy());
    }

    #[test]
    fn test_default_policy_override() {
        let registry = registry(
            r#"
default_policy:
  limit: 30
  window_seconds: 60
  burst_limit: 5
  burst_window_seconds: 1
"#,
        )
        .unwrap();
        assert_eq!(registry.get_policy("anything").limit, 30);
    }

    #[test]
    fn test_burst_above_limit_is_rejected() {
        let result = registry(
            r#"
policies:
  api:
    limit: 10
    window_seconds: 60
    burst_limit: 11
    burst_window_seconds: 1
"#,
        );
        assert!(matches!(result, Err(WardenError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_non_positive_durations_are_rejected() {
        for field in [
            "window_seconds: 0",
            "burst_window_seconds: 0",
            "block_duration_seconds: 0",
            "violation_threshold: 0",
        ] {
            let mut lines = vec![
                "policies:".to_string(),
                "  api:".to_string(),
                "    limit: 10".to_string(),
                "    burst_limit: 2".to_string(),
            ];
            let key = field.split(':').next().unwrap();
            if key != "window_seconds" {
                lines.push("    window_seconds: 60".to_string());
            }
            if key != "burst_window_seconds" {
                lines.push("    burst_window_seconds: 1".to_string());
            }
            lines.push(format!("    {}", field));

            let result = registry(&lines.join("\n"));
            assert!(
                matches!(result, Err(WardenError::ConfigurationInvalid(_))),
                "{field} should be rejected"
            );
        }
    }

    #[test]
    fn test_unbounded_durations_are_rejected() {
        for value in [".inf", ".nan", "1.0e20"] {
            for key in ["window_seconds", "burst_window_seconds", "block_duration_seconds"] {
                let mut lines = vec![
                    "policies:".to_string(),
                    "  api:".to_string(),
                    "    limit: 10".to_string(),
                    "    burst_limit: 2".to_string(),
                ];
                if key != "window_seconds" {
                    lines.push("    window_seconds: 60".to_string());
                }
                if key != "burst_window_seconds" {
                    lines.push("    burst_window_seconds: 1".to_string());
                }
                lines.push(format!("    {}: {}", key, value));

                let result = registry(&lines.join("\n"));
                assert!(
                    matches!(result, Err(WardenError::ConfigurationInvalid(_))),
                    "{key}: {value} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_ten_year_window_is_accepted() {
        let registry = registry(
            r#"
policies:
  archive:
    limit: 10
    window_seconds: 315360000
    burst_limit: 2
    burst_window_seconds: 1
    block_duration_seconds: 315360000
"#,
        )
        .unwrap();
        assert_eq!(registry.get_policy("archive").window_seconds, MAX_DURATION_SECONDS);
    }

    #[test]
    fn test_unknown_class_memory_is_capped() {
        let registry = registry("policies: {}").unwrap();
        for i in 0..MAX_REPORTED_UNKNOWN * 3 {
            let policy = registry.get_policy(&format!("/items/{}", i));
            assert_eq!(policy, registry.default_policy());
        }
        assert_eq!(registry.reported_unknown.len(), MAX_REPORTED_UNKNOWN);

        // Repeats of a remembered class don't grow the set either.
        registry.get_policy("/items/0");
        assert_eq!(registry.reported_unknown.len(), MAX_REPORTED_UNKNOWN);
    }

    #[test]
    fn test_scaled_policy_keeps_minimum_of_one() {
        let policy = PolicyConfig::unclassified();

        let doubled = policy.scaled(2.0);
        assert_eq!(doubled.limit, 200);
        assert_eq!(doubled.burst_limit, 40);

        let tiny = policy.scaled(0.001);
        assert_eq!(tiny.limit, 1);
        assert_eq!(tiny.burst_limit, 1);
        assert!(tiny.validate("tiny").is_ok());
    }

    #[test]
    fn test_policies_are_sorted() {
        let registry = registry(
            r#"
policies:
  zeta: { limit: 1, window_seconds: 1, burst_limit: 1, burst_window_seconds: 1 }
  alpha: { limit: 1, window_seconds: 1, burst_limit: 1, burst_window_seconds: 1 }
"#,
        )
        .unwrap();
        let names: Vec<_> = registry.policies().into_iter().map(|(c, _)| c).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
