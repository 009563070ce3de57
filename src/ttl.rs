//! TTL policy resolver
//!
//! Maps a source to its freshness window. Built once from [`TtlConfig`] and
//! never mutated afterwards; the cache manager shares it behind an `Arc`.

use crate::config::{TtlConfig, days_to_duration};
use crate::error::CacheError;
use std::collections::HashMap;
use std::time::Duration;

/// Resolved TTL table
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default: Duration,
    per_source: HashMap<String, Duration>,
}

impl TtlPolicy {
    /// Build from explicit durations
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_source: HashMap::new(),
        }
    }

    /// Builder-style per-source override
    #[must_use]
    pub fn with_source(mut self, source_id: impl Into<String>, ttl: Duration) -> Self {
        self.per_source.insert(source_id.into(), ttl);
        self
    }

    /// Build from the `[ttl]` configuration section
    ///
    /// # Errors
    ///
    /// `CacheError::Config` if any day count is negative or non-finite.
    pub fn from_config(config: &TtlConfig) -> Result<Self, CacheError> {
        let mut policy = Self::new(days_to_duration(config.default_days)?);
        for (source, days) in &config.sources {
            policy.per_source.insert(source.clone(), days_to_duration(*days)?);
        }
        Ok(policy)
    }

    /// Explicit override, else the source's configured TTL, else the default.
    ///
    /// A zero result means the response must not be cached.
    #[must_use]
    pub fn resolve(&self, source_id: &str, explicit_override: Option<Duration>) -> Duration {
        explicit_override
            .or_else(|| self.per_source.get(source_id).copied())
            .unwrap_or(self.default)
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    #[test]
    fn test_resolution_order() {
        let policy = TtlPolicy::new(WEEK).with_source("X", HOUR);

        assert_eq!(policy.resolve("X", None), HOUR);
        assert_eq!(policy.resolve("Y", None), WEEK);
        assert_eq!(policy.resolve("X", Some(Duration::from_secs(300))), Duration::from_secs(300));
        assert_eq!(policy.resolve("Y", Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn test_from_config_with_fractional_days() {
        let mut config = TtlConfig::default();
        config.sources.insert("X".into(), 0.25);
        config.sources.insert("never".into(), 0.0);

        let policy = TtlPolicy::from_config(&config).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(policy.resolve("X", None), Duration::from_secs(6 * 3600));
        assert_eq!(policy.resolve("never", None), Duration::ZERO);
        assert_eq!(policy.resolve("other", None), WEEK);
    }
}
