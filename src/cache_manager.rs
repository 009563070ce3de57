//! Cache Manager - Unified Cache Operations
//!
//! Routes every lookup Hot → Warm → Cold. Hot hits return immediately.
//! Everything slower runs inside a per-key single flight, so concurrent
//! misses for one key cost a single warm read or cold call. Warm hits are
//! promoted to the hot tier; cold results are written to warm, then hot,
//! before the caller sees them.
//!
//! Failures below the cold gate never fail a read: an unreachable warm tier
//! is counted as a degraded read and treated as a miss, and an entry that
//! cannot be decoded is dropped from both tiers and treated as a miss.

use crate::backends::{HotEntry, HotTier, HotTierStats, WarmStorage, WarmTier};
use crate::builder::CacheManagerBuilder;
use crate::clock::Clock;
use crate::cold_fetcher::{ColdFetchStats, ColdFetcher};
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::envelope::Envelope;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::{EpochTicket, InvalidationManager, InvalidationStats, PurgeScope, Removed};
use crate::key::{CacheKey, KeyCodec, Params};
use crate::prefetch::{PrefetchHandle, PrefetchJob, PrefetchScheduler};
use crate::single_flight::SingleFlight;
use crate::stats::{AlertEvent, ServedBy, StatsCollector, StatsSnapshot};
use crate::traits::{Connector, WarmOutcome, Warmer};
use crate::ttl::TtlPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the maintenance task evaluates monitoring thresholds
const ALERT_EVAL_INTERVAL: Duration = Duration::from_secs(60);

/// Per-read options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Replaces the source's TTL when the value is written back
    pub ttl_override: Option<Duration>,
    /// Skip Hot and Warm and always go to the cold gate
    pub force_refresh: bool,
}

impl ReadOptions {
    #[must_use]
    pub const fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl_override: Some(ttl),
            force_refresh: false,
        }
    }

    #[must_use]
    pub const fn refresh() -> Self {
        Self {
            ttl_override: None,
            force_refresh: true,
        }
    }
}

/// Options for an explicit [`CacheManager::put`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub version_tag: Option<String>,
    pub ttl_override: Option<Duration>,
}

/// Everything the manager knows about itself
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub reads: StatsSnapshot,
    pub hot: HotTierStats,
    /// `None` when the warm tier could not be queried
    pub warm: Option<WarmStorage>,
    pub cold: ColdFetchStats,
    pub invalidation: InvalidationStats,
    pub in_flight: usize,
}

/// Running maintenance tasks; see [`CacheManager::start_maintenance`]
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop all tasks and wait for them to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Maintenance task failed");
            }
        }
    }
}

/// One logical request travelling through the read path
#[derive(Debug, Clone)]
struct Request {
    key: CacheKey,
    source_id: String,
    operation: String,
    params: Params,
    options: ReadOptions,
}

/// Value plus the tier that produced it, shared by every caller of one flight
#[derive(Debug, Clone)]
struct Loaded {
    value: Arc<Value>,
    served_by: ServedBy,
}

/// Cache Manager - Unified operations across Hot, Warm and Cold tiers
///
/// Cheap to clone; clones share every tier and counter.
#[derive(Clone)]
pub struct CacheManager {
    pub(crate) hot: Arc<HotTier>,
    pub(crate) warm: WarmTier,
    pub(crate) cold: Arc<ColdFetcher>,
    pub(crate) invalidation: Arc<InvalidationManager>,
    pub(crate) stats: Arc<StatsCollector>,
    pub(crate) envelope: Arc<Envelope>,
    pub(crate) clock: Arc<dyn Clock>,
    ttl: Arc<TtlPolicy>,
    flights: Arc<SingleFlight<CacheKey, CacheResult<Loaded>>>,
    config: Arc<CacheConfig>,
}

impl CacheManager {
    /// Start configuring a manager
    #[must_use]
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        hot: Arc<HotTier>,
        warm: WarmTier,
        cold: Arc<ColdFetcher>,
        ttl: TtlPolicy,
        envelope: Envelope,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let invalidation = Arc::new(InvalidationManager::new(Arc::clone(&hot), warm.clone()));
        let stats = Arc::new(StatsCollector::new(config.monitoring));
        Self {
            hot,
            warm,
            cold,
            invalidation,
            stats,
            envelope: Arc::new(envelope),
            clock,
            ttl: Arc::new(ttl),
            flights: Arc::new(SingleFlight::new()),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register (or replace) the connector serving `source_id`
    pub fn register_connector(&self, source_id: impl Into<String>, connector: Arc<dyn Connector>) {
        self.cold.register(source_id, connector);
    }

    /// Get a value, fetching it through the cold gate on a miss
    ///
    /// # Errors
    ///
    /// Cold gate failures (`Fetch`, `UnknownSource`) when no tier holds the
    /// value. Warm tier trouble never surfaces here.
    pub async fn get_or_fetch(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<Arc<Value>> {
        self.get_or_fetch_with(source_id, operation, params, ReadOptions::default())
            .await
    }

    /// [`get_or_fetch`](Self::get_or_fetch) with a TTL override or forced refresh.
    ///
    /// Concurrent callers for the same key share one flight; the options of
    /// the caller that started it apply. A forced refresh joining a flight
    /// that was answered from Hot or Warm starts a new flight.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_fetch`](Self::get_or_fetch).
    pub async fn get_or_fetch_with(
        &self,
        source_id: &str,
        operation: &str,
        params: &Params,
        options: ReadOptions,
    ) -> CacheResult<Arc<Value>> {
        let started = Instant::now();
        let key = KeyCodec::encode(source_id, operation, params);

        // Fast path: hot tier, no coalescing needed
        if !options.force_refresh {
            if let Some(entry) = self.hot.get(&key).await {
                debug!(key = %key, source = %source_id, "[Hot] Cache hit");
                self.stats.record_read(source_id, ServedBy::Hot, started.elapsed());
                return Ok(entry.value);
            }
        }

        let request = Request {
            key,
            source_id: source_id.to_string(),
            operation: operation.to_string(),
            params: params.clone(),
            options,
        };
        let result = loop {
            let this = self.clone();
            let request = request.clone();
            let (result, leader) = self
                .flights
                .run(key, move || async move { this.load(request).await })
                .await;
            let result = result.map_err(|e| CacheError::Internal(e.to_string())).and_then(|r| r);
            if leader {
                break result;
            }
            debug!(key = %key, source = %source_id, "Joined in-flight request");
            // A refresh only accepts a joined result that came from the source
            match &result {
                Ok(loaded) if options.force_refresh && loaded.served_by != ServedBy::Cold => {}
                _ => break result,
            }
        };

        match result {
            Ok(loaded) => {
                self.stats.record_read(source_id, loaded.served_by, started.elapsed());
                Ok(loaded.value)
            }
            Err(e) => {
                self.stats.record_failed_read(source_id);
                Err(e)
            }
        }
    }

    /// Typed variant of [`get_or_fetch`](Self::get_or_fetch)
    ///
    /// # Errors
    ///
    /// As `get_or_fetch`, plus `Serialization` if the value does not
    /// deserialize into `T`.
    pub async fn get_or_fetch_typed<T: DeserializeOwned>(
        &self,
        source_id: &str,
        operation: &str,
        params: &Params,
    ) -> CacheResult<T> {
        let value = self.get_or_fetch(source_id, operation, params).await?;
        T::deserialize(&*value).map_err(|e| {
            CacheError::Serialization(format!(
                "cached value is not a valid {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Fetch through the cold gate even if a live entry exists, replacing it.
    ///
    /// This is where an upstream version change is noticed on unexpired entries.
    ///
    /// # Errors
    ///
    /// Cold gate failures.
    pub async fn refresh(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<Arc<Value>> {
        self.get_or_fetch_with(source_id, operation, params, ReadOptions::refresh())
            .await
    }

    /// Hot then Warm, never the cold gate
    pub async fn peek(&self, source_id: &str, operation: &str, params: &Params) -> Option<Arc<Value>> {
        let key = KeyCodec::encode(source_id, operation, params);
        if let Some(entry) = self.hot.get(&key).await {
            return Some(entry.value);
        }
        let ticket = self.invalidation.ticket(source_id);
        self.read_warm(&key, source_id, ticket).await
    }

    /// Whether an unexpired warm entry exists for the request
    pub async fn is_cached(&self, source_id: &str, operation: &str, params: &Params) -> bool {
        let key = KeyCodec::encode(source_id, operation, params);
        match self.warm.contains_live(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, error = %e, "Warm tier unavailable for liveness check");
                self.stats.record_degraded_read();
                false
            }
        }
    }

    /// Store a value through the same write path as a cold fetch.
    ///
    /// Returns `false` when nothing was stored (zero TTL, or a concurrent purge).
    ///
    /// # Errors
    ///
    /// `Serialization` if the value cannot be encoded, `TierUnavailable` if
    /// the warm tier rejects the write.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        source_id: &str,
        operation: &str,
        params: &Params,
        value: &T,
        options: PutOptions,
    ) -> CacheResult<bool> {
        let value = Arc::new(serde_json::to_value(value)?);
        let request = Request {
            key: KeyCodec::encode(source_id, operation, params),
            source_id: source_id.to_string(),
            operation: operation.to_string(),
            params: params.clone(),
            options: ReadOptions {
                ttl_override: options.ttl_override,
                force_refresh: false,
            },
        };
        let ticket = self.invalidation.ticket(source_id);
        self.write_back(&request, value, options.version_tag, ticket).await
    }

    /// The slow path, run once per flight
    async fn load(&self, request: Request) -> CacheResult<Loaded> {
        let ticket = self.invalidation.ticket(&request.source_id);

        if !request.options.force_refresh {
            // Another flight may have just filled the hot tier
            if let Some(entry) = self.hot.get(&request.key).await {
                return Ok(Loaded {
                    value: entry.value,
                    served_by: ServedBy::Hot,
                });
            }
            if let Some(value) = self.read_warm(&request.key, &request.source_id, ticket).await {
                return Ok(Loaded {
                    value,
                    served_by: ServedBy::Warm,
                });
            }
        }

        debug!(key = %request.key, source = %request.source_id, "Cache miss, fetching from source");
        let response = self
            .cold
            .fetch(&request.source_id, &request.operation, &request.params)
            .await?;
        let value = Arc::new(response.value);

        if let Err(e) = self
            .write_back(&request, Arc::clone(&value), response.version_tag, ticket)
            .await
        {
            warn!(key = %request.key, source = %request.source_id, error = %e, "Failed to cache fetched value");
        }

        Ok(Loaded {
            value,
            served_by: ServedBy::Cold,
        })
    }

    /// Warm lookup with decode, promotion and self-healing
    async fn read_warm(&self, key: &CacheKey, source_id: &str, ticket: EpochTicket) -> Option<Arc<Value>> {
        let entry = match self.warm.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e @ CacheError::CorruptEntry { .. }) => {
                self.drop_corrupt(key, source_id, &e).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, source = %source_id, error = %e, "Warm tier unavailable, degrading to cold fetch");
                self.stats.record_degraded_read();
                return None;
            }
        };

        let value: Value = match self.envelope.decode(&key.to_hex(), &entry.payload, entry.compressed) {
            Ok(value) => value,
            Err(e) => {
                self.drop_corrupt(key, source_id, &e).await;
                return None;
            }
        };
        let value = Arc::new(value);
        debug!(key = %key, source = %source_id, "[Warm] Cache hit, promoting");

        let hot_entry = HotEntry::new(
            Arc::clone(&value),
            &entry.source_id,
            entry.version_tag.as_deref(),
            entry.expires_at,
            entry.size_bytes,
        );
        self.invalidation
            .fenced_write(source_id, ticket, || self.hot.put(*key, hot_entry))
            .await;
        self.spawn_record_hit(*key);
        Some(value)
    }

    async fn drop_corrupt(&self, key: &CacheKey, source_id: &str, cause: &CacheError) {
        warn!(key = %key, source = %source_id, error = %cause, "Dropping corrupt cache entry");
        self.stats.record_corrupt_entry();
        if let Err(e) = self.warm.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete corrupt entry");
        }
        self.hot.evict(key).await;
    }

    /// Best-effort persisted hit count; never delays the read
    fn spawn_record_hit(&self, key: CacheKey) {
        let warm = self.warm.clone();
        tokio::spawn(async move {
            if let Err(e) = warm.record_hit(&key).await {
                debug!(key = %key, error = %e, "Failed to record warm hit");
            }
        });
    }

    /// Encode, version-check and store in Warm then Hot.
    ///
    /// Returns `Ok(false)` when the TTL resolves to zero or a purge overtook
    /// the write.
    async fn write_back(
        &self,
        request: &Request,
        value: Arc<Value>,
        version_tag: Option<String>,
        ticket: EpochTicket,
    ) -> CacheResult<bool> {
        let key = request.key;
        let ttl = self.ttl.resolve(&request.source_id, request.options.ttl_override);
        if ttl.is_zero() {
            debug!(key = %key, source = %request.source_id, "TTL resolves to zero, not caching");
            return Ok(false);
        }

        let encoded = self.envelope.encode(value.as_ref())?;
        if encoded.compression_failed {
            self.stats.record_compression_fallback();
        }

        if let Err(e) = self
            .invalidation
            .check_version(&key, version_tag.as_deref())
            .await
        {
            warn!(key = %key, error = %e, "Version check failed");
        }

        let created_at = self.clock.now();
        let expires_at = expiry(created_at, ttl);
        let size_bytes = encoded.body_len as u64;
        let stored_bytes = encoded.bytes.len() as u64;
        let entry = CacheEntry {
            key,
            source_id: request.source_id.clone(),
            operation: request.operation.clone(),
            params: request.params.clone(),
            payload: Bytes::from(encoded.bytes),
            compressed: encoded.compressed,
            version_tag: version_tag.clone(),
            created_at,
            expires_at,
            size_bytes,
            hit_count: 0,
        };
        let hot_entry = HotEntry::new(
            value,
            &request.source_id,
            version_tag.as_deref(),
            expires_at,
            size_bytes,
        );

        let written = self
            .invalidation
            .fenced_write(&request.source_id, ticket, || async {
                // The hot tier only ever holds what the warm tier accepted
                self.warm.put(entry).await?;
                self.hot.put(key, hot_entry).await;
                Ok::<_, CacheError>(())
            })
            .await;

        match written {
            None => Ok(false),
            Some(Ok(())) => {
                self.stats.record_write(&request.source_id, stored_bytes);
                debug!(
                    key = %key,
                    source = %request.source_id,
                    bytes = stored_bytes,
                    compressed = encoded.compressed,
                    ttl_secs = ttl.as_secs(),
                    "[Warm+Hot] Cached entry"
                );
                Ok(true)
            }
            Some(Err(e)) => {
                self.stats.record_failed_write();
                Err(e)
            }
        }
    }

    /// Remove one request's entry from both tiers
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn purge_key(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<Removed> {
        self.invalidation
            .purge(PurgeScope::Key {
                source_id: source_id.to_string(),
                key: KeyCodec::encode(source_id, operation, params),
            })
            .await
    }

    /// Remove every entry of a source from both tiers
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn purge_source(&self, source_id: &str) -> CacheResult<Removed> {
        self.invalidation
            .purge(PurgeScope::Source(source_id.to_string()))
            .await
    }

    /// Remove everything from both tiers
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn clear_all(&self) -> CacheResult<Removed> {
        self.invalidation.purge(PurgeScope::All).await
    }

    /// Run one expiry sweep now
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn sweep_expired(&self) -> CacheResult<Removed> {
        self.invalidation.sweep_expired().await
    }

    /// Submit a prefetch job
    ///
    /// # Errors
    ///
    /// `PrefetchDisabled` when `prefetch.enabled` is false.
    pub fn prefetch(&self, job: PrefetchJob) -> CacheResult<PrefetchHandle> {
        PrefetchScheduler::new(Arc::new(self.clone()), self.config.prefetch).submit(job)
    }

    /// Statistics across all tiers
    pub async fn stats(&self) -> CacheStats {
        let warm = match self.warm.storage().await {
            Ok(storage) => Some(storage),
            Err(e) => {
                warn!(error = %e, "Warm tier unavailable for stats");
                None
            }
        };
        CacheStats {
            reads: self.stats.snapshot(),
            hot: self.hot.stats().await,
            warm,
            cold: self.cold.stats(),
            invalidation: self.invalidation.stats(),
            in_flight: self.flights.in_flight(),
        }
    }

    /// Receive monitoring alerts
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.stats.subscribe()
    }

    /// Check monitoring thresholds now
    pub fn evaluate_alerts(&self) -> Vec<AlertEvent> {
        self.stats.evaluate_alerts()
    }

    /// Spawn the periodic expiry sweep and the alert evaluator
    #[must_use]
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        let shutdown = CancellationToken::new();
        let sweeper = self
            .invalidation
            .spawn_sweeper(self.config.invalidation.sweep_interval(), shutdown.clone());

        let stats = Arc::clone(&self.stats);
        let token = shutdown.clone();
        let evaluator = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALERT_EVAL_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        stats.evaluate_alerts();
                    }
                }
            }
        });

        info!(
            sweep_interval_secs = self.config.invalidation.sweep_interval_secs,
            "Cache maintenance started"
        );
        MaintenanceHandle {
            shutdown,
            tasks: vec![sweeper, evaluator],
        }
    }

    /// Round-trip probe of both tiers
    pub async fn health_check(&self) -> bool {
        let hot_ok = self.hot.health_check().await;
        let warm_ok = self.warm.health_check().await;
        if !(hot_ok && warm_ok) {
            warn!(hot = hot_ok, warm = warm_ok, "Cache health check failed");
        }
        hot_ok && warm_ok
    }
}

fn expiry(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| created_at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Warmer for CacheManager {
    async fn is_warm(&self, source_id: &str, operation: &str, params: &Params) -> bool {
        self.is_cached(source_id, operation, params).await
    }

    async fn warm(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<WarmOutcome> {
        if self.is_cached(source_id, operation, params).await {
            return Ok(WarmOutcome::AlreadyWarm);
        }
        self.get_or_fetch(source_id, operation, params).await?;
        Ok(WarmOutcome::Fetched)
    }
}
