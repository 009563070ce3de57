//! Market Data Cache
//!
//! A multi-tier cache that sits in front of rate-limited market-data
//! sources:
//! - **Hot tier**: in-process LRU (moka) with a byte budget
//! - **Warm tier**: SQLite in WAL mode, surviving restarts
//! - **Cold tier**: the connector registered for each source, behind a
//!   per-source request budget (governor)
//! - **Stampede protection**: concurrent misses for one key share one fetch
//! - **Invalidation**: TTL expiry, version tags and atomic purges
//! - **Prefetching**: bounded, cancellable warming of nearby markets
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use market_data_cache::{
//!     CacheManager, Connector, FetchError, FetchResponse, Params, async_trait,
//! };
//! use std::sync::Arc;
//!
//! struct Census;
//!
//! #[async_trait]
//! impl Connector for Census {
//!     async fn fetch(&self, _operation: &str, params: &Params) -> Result<FetchResponse, FetchError> {
//!         Ok(FetchResponse::new(serde_json::json!({"params": params})))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheManager::builder()
//!         .with_warm_path("cache/market_data.db")
//!         .with_connector("census", Arc::new(Census))
//!         .build()
//!         .await?;
//!
//!     let params = Params::new().with("market", "austin-tx").with("year", 2023);
//!     let value = cache.get_or_fetch("census", "population", &params).await?;
//!     tracing::info!(%value, "Population");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Hot (moka) → Warm (SQLite) → Cold (connector, rate limited)
//!           ↓ Hit         ↓ Hit           ↓ Fetched
//!           Return        Promote to Hot   Store in Warm, then Hot
//! ```

pub mod admin;
pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod clock;
pub mod codecs;
pub mod cold_fetcher;
pub mod config;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod prefetch;
pub mod single_flight;
pub mod stats;
pub mod traits;
pub mod ttl;

pub use admin::{
    BenchmarkReport, ClearExpiredReport, DecodeFailure, EntryView, ExportReport, InspectReport,
    PurgeReport, StatsReport,
};
pub use backends::{HotEntry, HotTier, HotTierStats, SourceSummary, WarmStorage, WarmTier};
pub use builder::CacheManagerBuilder;
pub use cache_manager::{CacheManager, CacheStats, MaintenanceHandle, PutOptions, ReadOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cold_fetcher::{ColdFetchStats, ColdFetcher};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use envelope::Envelope;
pub use error::{CacheError, CacheResult, FetchError, Tier};
pub use invalidation::{InvalidationStats, PurgeScope, Removed};
pub use key::{CacheKey, KeyCodec, ParamValue, Params};
pub use prefetch::{PrefetchHandle, PrefetchJob, PrefetchProgress, PrefetchScheduler, PrefetchTarget};
pub use stats::{AlertEvent, LatencySummary, ServedBy, StatsSnapshot};
pub use traits::{CacheCodec, Connector, FetchResponse, WarmOutcome, Warmer};
pub use ttl::TtlPolicy;

// Re-export async_trait for connector implementations
pub use async_trait::async_trait;
