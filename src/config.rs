//! Configuration management for Warden.
//!
//! The policy file is YAML. Connection settings for the shared store can be
//! overridden from the environment (`WARDEN__STORE__REDIS_URL` and friends) so
//! deployments don't have to bake them into the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::clock::is_valid_duration;
use crate::error::{Result, WardenError};
use crate::ratelimit::PolicySpec;

/// Main configuration for the Warden engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Identity resolution settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Counter store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Violation tracking settings
    #[serde(default)]
    pub violations: ViolationConfig,

    /// Adaptive strategy tuning
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Monitoring export settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Override for the policy applied to unknown endpoint classes
    #[serde(default)]
    pub default_policy: Option<PolicySpec>,

    /// Policies by endpoint class
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySpec>,
}

/// How client addresses are classified and keyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Treat private, loopback and link-local ranges as trusted
    #[serde(default = "default_trust_private")]
    pub trust_private_ranges: bool,

    /// Addresses or CIDR ranges that are always trusted
    #[serde(default)]
    pub allow: Vec<String>,

    /// Addresses or CIDR ranges that are always suspicious; wins over `allow`
    #[serde(default)]
    pub deny: Vec<String>,

    /// IPv6 clients are keyed by this prefix length
    #[serde(default = "default_ipv6_prefix_len")]
    pub ipv6_prefix_len: u8,

    /// Limit multiplier for trusted identities
    #[serde(default = "default_trusted_scale")]
    pub trusted_limit_scale: f64,

    /// Limit multiplier for suspicious identities
    #[serde(default = "default_suspicious_scale")]
    pub suspicious_limit_scale: f64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_private_ranges: default_trust_private(),
            allow: Vec::new(),
            deny: Vec::new(),
            ipv6_prefix_len: default_ipv6_prefix_len(),
            trusted_limit_scale: default_trusted_scale(),
            suspicious_limit_scale: default_suspicious_scale(),
        }
    }
}

fn default_trust_private() -> bool {
    true
}

fn default_ipv6_prefix_len() -> u8 {
    64
}

fn default_trusted_scale() -> f64 {
    2.0
}

fn default_suspicious_scale() -> f64 {
    0.5
}

/// Which counter store implementation to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, single instance only
    #[default]
    Memory,
    /// Redis shared cache, for multi-instance deployments
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every key written to the shared cache
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single shared-cache operation, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Compare-and-swap attempts before an update is given up
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    /// Counter records expire after this many windows without activity
    #[serde(default = "default_idle_ttl_multiplier")]
    pub idle_ttl_multiplier: u32,

    /// Interval between idle-record sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            max_cas_retries: default_max_cas_retries(),
            idle_ttl_multiplier: default_idle_ttl_multiplier(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    /// Operation timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_key_prefix() -> String {
    "warden:".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_max_cas_retries() -> u32 {
    16
}

fn default_idle_ttl_multiplier() -> u32 {
    2
}

fn default_sweep_interval() -> u64 {
    30
}

/// Violation tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationConfig {
    /// Violations older than this are forgiven, in seconds
    #[serde(default = "default_decay_window")]
    pub decay_window_seconds: f64,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            decay_window_seconds: default_decay_window(),
        }
    }
}

fn default_decay_window() -> f64 {
    600.0
}

/// How the adaptive strategy's risk score falls back toward zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskDecayConfig {
    /// Halves every `half_life_seconds`; defaults to the violation decay window
    Exponential {
        #[serde(default)]
        half_life_seconds: Option<f64>,
    },
    /// Drops by `per_second` every second
    Linear { per_second: f64 },
}

impl Default for RiskDecayConfig {
    fn default() -> Self {
        RiskDecayConfig::Exponential {
            half_life_seconds: None,
        }
    }
}

/// Adaptive strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// `k` in `effective_limit = limit / (1 + risk_score * k)`
    #[serde(default = "default_risk_factor")]
    pub risk_factor: f64,

    /// Risk score decay function
    #[serde(default)]
    pub decay: RiskDecayConfig,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            risk_factor: default_risk_factor(),
            decay: RiskDecayConfig::default(),
        }
    }
}

fn default_risk_factor() -> f64 {
    0.5
}

/// Monitoring export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Size of the recent-violations ring buffer
    #[serde(default = "default_recent_violations")]
    pub recent_violations: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            recent_violations: default_recent_violations(),
        }
    }
}

fn default_recent_violations() -> usize {
    100
}

/// Environment overrides, read through the `config` crate.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    store: Option<StoreOverrides>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreOverrides {
    backend: Option<StoreBackend>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
    timeout_ms: Option<u64>,
}

impl WardenConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a file path, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `WARDEN__`-prefixed environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let source = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let overrides: EnvOverrides = source.try_deserialize()?;

        if let Some(store) = overrides.store {
            if let Some(backend) = store.backend {
                self.store.backend = backend;
            }
            if let Some(url) = store.redis_url {
                self.store.redis_url = Some(url);
            }
            if let Some(prefix) = store.key_prefix {
                self.store.key_prefix = prefix;
            }
            if let Some(timeout) = store.timeout_ms {
                self.store.timeout_ms = timeout;
            }
        }
        Ok(())
    }

    /// Check the non-policy sections. Policies are checked when the registry
    /// is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(WardenError::ConfigurationInvalid(msg.to_string()));

        if self.identity.ipv6_prefix_len == 0 || self.identity.ipv6_prefix_len > 128 {
            return invalid("identity.ipv6_prefix_len must be within 1..=128");
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.identity.trusted_limit_scale) || !positive(self.identity.suspicious_limit_scale)
        {
            return invalid("identity limit scales must be positive");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return invalid("store.redis_url is required for the redis backend");
        }
        if self.store.timeout_ms == 0 {
            return invalid("store.timeout_ms must be positive");
        }
        if self.store.idle_ttl_multiplier == 0 {
            return invalid("store.idle_ttl_multiplier must be at least 1");
        }
        if self.store.sweep_interval_secs == 0 {
            return invalid("store.sweep_interval_secs must be positive");
        }
        if !is_valid_duration(self.violations.decay_window_seconds) {
            return invalid("violations.decay_window_seconds must be positive, finite and at most ten years");
        }
        if !(self.adaptive.risk_factor.is_finite() && self.adaptive.risk_factor >= 0.0) {
            return invalid("adaptive.risk_factor must not be negative");
        }
        match self.adaptive.decay {
            RiskDecayConfig::Exponential {
                half_life_seconds: Some(h),
            } if !is_valid_duration(h) => {
                return invalid("adaptive.decay.half_life_seconds must be positive, finite and at most ten years")
            }
            RiskDecayConfig::Linear { per_second } if !positive(per_second) => {
                return invalid("adaptive.decay.per_second must be positive")
            }
            _ => {}
        }
        if self.monitoring.recent_violations == 0 {
            return invalid("monitoring.recent_violations must be at least 1");
        }
        Ok(())
    }
}
