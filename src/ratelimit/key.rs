//! Store key layout.
//!
//! Counters live under `counter|{identity}|{class}` and violation state under
//! `violation|{identity}`. Identity keys never contain `|`, so a class name
//! may.

use std::fmt;

/// Prefix shared by all counter records.
pub const COUNTER_PREFIX: &str = "counter|";
/// Prefix shared by all violation records.
pub const VIOLATION_PREFIX: &str = "violation|";

/// Key of the counter record for one identity and endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub identity: String,
    pub class: String,
}

impl CounterKey {
    pub fn new(identity: &str, class: &str) -> Self {
        Self {
            identity: identity.to_string(),
            class: class.to_string(),
        }
    }

    /// Format: `counter|{identity}|{class}`
    pub fn to_store_key(&self) -> String {
        format!("{}{}|{}", COUNTER_PREFIX, self.identity, self.class)
    }

    /// Parse a store key back into its parts.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(COUNTER_PREFIX)?;
        let (identity, class) = rest.split_once('|')?;
        if identity.is_empty() {
            return None;
        }
        Some(Self::new(identity, class))
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Key of the violation record for an identity.
pub fn violation_key(identity: &str) -> String {
    format!("{}{}", VIOLATION_PREFIX, identity)
}

/// Identity part of a violation key.
pub fn identity_from_violation_key(key: &str) -> Option<&str> {
    key.strip_prefix(VIOLATION_PREFIX)
        .filter(|identity| !identity.is_empty())
}
