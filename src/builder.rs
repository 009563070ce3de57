//! Cache Manager Builder
//!
//! Assembles a [`CacheManager`] from a [`CacheConfig`], validating it first.
//!
//! # Example
//!
//! ```rust,no_run
//! use market_data_cache::{CacheConfig, CacheManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheManager::builder()
//!         .with_config(CacheConfig::default())
//!         .with_warm_path("/tmp/market_data.db")
//!         .build()
//!         .await?;
//!     assert!(cache.health_check().await);
//!     Ok(())
//! }
//! ```

use crate::backends::{HotTier, WarmTier};
use crate::cache_manager::CacheManager;
use crate::clock::{Clock, SystemClock};
use crate::cold_fetcher::ColdFetcher;
use crate::config::CacheConfig;
use crate::envelope::Envelope;
use crate::error::CacheResult;
use crate::traits::Connector;
use crate::ttl::TtlPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builder for [`CacheManager`]
///
/// Defaults: [`CacheConfig::default`], the system clock and no connectors.
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    connectors: Vec<(String, Arc<dyn Connector>)>,
}

impl CacheManagerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            connectors: Vec::new(),
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Override `warm.path`
    #[must_use]
    pub fn with_warm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.warm.path = path.into();
        self
    }

    /// Register a connector for `source_id`; later registrations replace earlier ones
    #[must_use]
    pub fn with_connector(mut self, source_id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push((source_id.into(), connector));
        self
    }

    /// Use a custom clock for entry timestamps and expiry
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and open both tiers
    ///
    /// # Errors
    ///
    /// - `Config` if the configuration is invalid
    /// - `TierUnavailable` if the warm database cannot be opened
    pub async fn build(self) -> CacheResult<CacheManager> {
        let config = self.config;
        config.validate()?;

        let ttl = TtlPolicy::from_config(&config.ttl)?;
        let cold = ColdFetcher::new(config.fetch, &config.rate_limits)?;
        for (source_id, connector) in self.connectors {
            cold.register(source_id, connector);
        }

        let hot = Arc::new(HotTier::new(config.hot, Arc::clone(&self.clock)));
        let warm = WarmTier::open(&config.warm, Arc::clone(&self.clock)).await?;
        let envelope = Envelope::json(config.compression);

        info!(
            warm_path = %config.warm.path.display(),
            hot_max_bytes = config.hot.max_bytes,
            sources = cold.sources().len(),
            "Market data cache built"
        );

        Ok(CacheManager::from_parts(
            hot,
            warm,
            Arc::new(cold),
            ttl,
            envelope,
            self.clock,
            config,
        ))
    }
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
