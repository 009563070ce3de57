//! Cache configuration
//!
//! Every recognized option lives here with its default. The whole structure
//! deserializes from TOML (missing sections and fields fall back to defaults)
//! and is validated once, when the cache manager is built.
//!
//! ```toml
//! [hot]
//! max_bytes = 134217728
//!
//! [warm]
//! path = "/var/cache/markets/warm.db"
//!
//! [ttl]
//! default_days = 7.0
//! sources = { realtime_quotes = 0.0416, census = 30.0 }
//!
//! [rate_limits]
//! realtime_quotes = { requests = 5, per_secs = 1.0 }
//! ```

use crate::error::CacheError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `warm.path`
pub const WARM_PATH_ENV: &str = "MDCACHE_WARM_PATH";

const SECS_PER_DAY: f64 = 86_400.0;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub hot: HotTierConfig,
    pub warm: WarmTierConfig,
    pub compression: CompressionConfig,
    pub ttl: TtlConfig,
    pub prefetch: PrefetchConfig,
    pub fetch: FetchConfig,
    /// Per-source request budgets; sources without an entry are not throttled
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub invalidation: InvalidationConfig,
    pub monitoring: MonitoringConfig,
}

/// Hot tier (in-process LRU)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HotTierConfig {
    /// Byte budget across all entries (default: 256 MiB)
    pub max_bytes: u64,
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Warm tier (SQLite, WAL journal)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmTierConfig {
    /// Database file (default: `cache/market_data.db`)
    pub path: PathBuf,
    /// Read-only connections serving concurrent lookups (default: 4)
    pub reader_connections: usize,
    /// How long a connection waits on a locked database (default: 5000 ms)
    pub busy_timeout_ms: u64,
}

impl Default for WarmTierConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cache/market_data.db"),
            reader_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl WarmTierConfig {
    /// Warm tier rooted at `path` with default tuning
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Envelope compression
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads strictly larger than this are compressed (default: 10 KiB)
    pub threshold_bytes: usize,
    /// zstd level 1..=22; 0 disables compression (default: 3)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 10 * 1024,
            level: 3,
        }
    }
}

/// Freshness policy, in (fractional) days
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// TTL for sources without an override (default: 7 days)
    pub default_days: f64,
    /// Per-source TTL; 0 means "never cache this source"
    pub sources: HashMap<String, f64>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_days: 7.0,
            sources: HashMap::new(),
        }
    }
}

/// Converts fractional days to a `Duration`, rejecting negative or non-finite input.
///
/// # Errors
///
/// Returns `CacheError::Config` for values that cannot be a duration.
pub fn days_to_duration(days: f64) -> Result<Duration, CacheError> {
    Duration::try_from_secs_f64(days * SECS_PER_DAY)
        .map_err(|_| CacheError::Config(format!("invalid TTL of {days} days")))
}

/// Prefetch scheduler
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Accept prefetch jobs at all (default: true)
    pub enabled: bool,
    /// Targets farther than this from the focus market are dropped (default: 50.0)
    pub neighbor_radius: f64,
    /// Worker pool size when a job does not set its own (default: 4)
    pub max_parallel: usize,
    /// Attempts per target when its source is rate limited (default: 5)
    pub max_rate_limit_retries: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            neighbor_radius: 50.0,
            max_parallel: 4,
            max_rate_limit_retries: 5,
        }
    }
}

/// Cold fetcher retry policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Extra attempts after a transient failure (default: 2)
    pub transient_retries: u32,
    /// First back-off after a transient failure, doubled each retry (default: 200 ms)
    pub transient_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            transient_backoff_ms: 200,
        }
    }
}

impl FetchConfig {
    #[must_use]
    pub const fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }
}

/// `requests` calls per `per_secs` seconds, bursting up to `requests`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per_secs: f64,
}

impl RateLimitConfig {
    #[must_use]
    pub const fn new(requests: u32, per_secs: f64) -> Self {
        Self { requests, per_secs }
    }

    /// `n` requests per second
    #[must_use]
    pub const fn per_second(n: u32) -> Self {
        Self::new(n, 1.0)
    }
}

/// Background expiry sweep
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Seconds between sweeps (default: 300)
    pub sweep_interval_secs: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
        }
    }
}

impl InvalidationConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Alert thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Alert when the overall hit rate drops below this fraction (default: 0.5)
    pub min_hit_rate: f64,
    /// Alert when p95 read latency exceeds this many milliseconds (default: 500)
    pub max_latency_ms: f64,
    /// Reads observed before any alert can fire (default: 100)
    pub min_samples: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.5,
            max_latency_ms: 500.0,
            min_samples: 100,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this structure.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("failed to parse cache configuration")
    }

    /// Load from a TOML file, then apply environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `MDCACHE_WARM_PATH` if set
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(WARM_PATH_ENV) {
            if !path.is_empty() {
                self.warm.path = PathBuf::from(path);
            }
        }
    }

    /// Reject configurations the cache cannot run with
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` naming the first offending option.
    pub fn validate(&self) -> Result<(), CacheError> {
        let fail = |msg: String| Err(CacheError::Config(msg));

        if self.hot.max_bytes == 0 {
            return fail("hot.max_bytes must be greater than zero".into());
        }
        if self.warm.reader_connections == 0 {
            return fail("warm.reader_connections must be at least 1".into());
        }
        if !(0..=22).contains(&self.compression.level) {
            return fail(format!(
                "compression.level must be within 0..=22, got {}",
                self.compression.level
            ));
        }
        days_to_duration(self.ttl.default_days)?;
        for (source, days) in &self.ttl.sources {
            days_to_duration(*days)
                .map_err(|_| CacheError::Config(format!("ttl.sources.{source}: invalid TTL of {days} days")))?;
        }
        if self.prefetch.max_parallel == 0 {
            return fail("prefetch.max_parallel must be at least 1".into());
        }
        if !self.prefetch.neighbor_radius.is_finite() || self.prefetch.neighbor_radius < 0.0 {
            return fail("prefetch.neighbor_radius must be a non-negative number".into());
        }
        for (source, limit) in &self.rate_limits {
            if limit.requests == 0 {
                return fail(format!("rate_limits.{source}.requests must be at least 1"));
            }
            if !limit.per_secs.is_finite() || limit.per_secs <= 0.0 {
                return fail(format!("rate_limits.{source}.per_secs must be positive"));
            }
        }
        if !(0.0..=1.0).contains(&self.monitoring.min_hit_rate) {
            return fail("monitoring.min_hit_rate must be within 0.0..=1.0".into());
        }
        if !self.monitoring.max_latency_ms.is_finite() || self.monitoring.max_latency_ms <= 0.0 {
            return fail("monitoring.max_latency_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hot.max_bytes, 256 * 1024 * 1024);
        assert_eq!(config.compression.threshold_bytes, 10 * 1024);
        assert!((config.ttl.default_days - 7.0).abs() < f64::EPSILON);
        assert_eq!(config.invalidation.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            [ttl]
            sources = { intraday = 0.5 }

            [rate_limits]
            intraday = { requests = 2, per_secs = 1.0 }
            "#,
        )
        .unwrap_or_else(|e| panic!("parse failed: {e}"));

        assert_eq!(config.prefetch.max_parallel, 4);
        assert_eq!(config.ttl.sources.get("intraday"), Some(&0.5));
        assert_eq!(config.rate_limits.get("intraday"), Some(&RateLimitConfig::per_second(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CacheConfig::default();
        config.compression.level = 40;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let mut config = CacheConfig::default();
        config.ttl.sources.insert("x".into(), -1.0);
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.rate_limits.insert("x".into(), RateLimitConfig::new(0, 1.0));
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.hot.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fractional_days() {
        let d = days_to_duration(1.0 / 24.0).unwrap_or_default();
        assert!((d.as_secs_f64() - 3600.0).abs() < 1e-3);
        assert!(days_to_duration(f64::NAN).is_err());
    }
}
