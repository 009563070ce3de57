//! Hot Tier - Moka In-Memory Cache
//!
//! Byte-budgeted, strict-LRU in-process cache for decoded values. Empty at
//! process start; it only ever holds copies of entries the warm tier has
//! accepted.

use crate::clock::Clock;
use crate::config::HotTierConfig;
use crate::entry::is_expired;
use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Cached value with the metadata needed for expiry and purges.
///
/// Readers receive a clone holding an `Arc` of the value, so an eviction
/// racing a read never leaves the reader with a partially dropped value.
#[derive(Debug, Clone)]
pub struct HotEntry {
    pub value: Arc<serde_json::Value>,
    pub source_id: Arc<str>,
    pub version_tag: Option<Arc<str>>,
    pub expires_at: DateTime<Utc>,
    /// Budget charge for this entry
    pub size_bytes: u64,
    hits: Arc<AtomicU64>,
}

impl HotEntry {
    #[must_use]
    pub fn new(
        value: Arc<serde_json::Value>,
        source_id: &str,
        version_tag: Option<&str>,
        expires_at: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            value,
            source_id: Arc::from(source_id),
            version_tag: version_tag.map(Arc::from),
            expires_at,
            size_bytes,
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hits served from the hot tier since this entry was inserted
    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn weight(&self) -> u32 {
        u32::try_from(self.size_bytes).unwrap_or(u32::MAX)
    }
}

/// Hot tier counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HotTierStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub entries: u64,
    pub weighted_bytes: u64,
    pub max_bytes: u64,
}

/// Moka-backed hot tier
///
/// - LRU eviction over a byte budget (weigher = entry size)
/// - Moka's internally sharded map, so unrelated keys do not contend
/// - Per-entry expiry checked against the injected clock on every read
pub struct HotTier {
    cache: Cache<CacheKey, HotEntry>,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl HotTier {
    /// Create new hot tier
    #[must_use]
    pub fn new(config: HotTierConfig, clock: Arc<dyn Clock>) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let eviction_counter = Arc::clone(&evictions);

        let cache = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &CacheKey, entry: &HotEntry| entry.weight())
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key, _entry, cause| {
                if cause == RemovalCause::Size {
                    eviction_counter.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "[Hot] Evicted least recently used entry");
                }
            })
            .build();

        info!(max_bytes = config.max_bytes, "Hot tier initialized (moka, LRU)");

        Self {
            cache,
            clock,
            max_bytes: config.max_bytes,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
            evictions,
        }
    }

    /// Get a live entry; expired entries are dropped and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<HotEntry> {
        match self.cache.get(key).await {
            Some(entry) if is_expired(entry.expires_at, self.clock.now()) => {
                self.cache.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert, evicting least-recently-used entries until the budget holds.
    ///
    /// Entries larger than the whole budget are not cached.
    pub async fn put(&self, key: CacheKey, entry: HotEntry) {
        if entry.size_bytes > self.max_bytes {
            debug!(key = %key, size = entry.size_bytes, "[Hot] Entry exceeds budget, not cached");
            self.cache.invalidate(&key).await;
            return;
        }
        self.cache.insert(key, entry).await;
        // Flush moka's buffers (reads first, then this insert) so eviction sees exact recency
        self.cache.run_pending_tasks().await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "[Hot] Cached entry");
    }

    /// Remove one key
    pub async fn evict(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Remove every entry belonging to `source_id`, returning how many were removed
    pub async fn evict_source(&self, source_id: &str) -> usize {
        let keys: Vec<Arc<CacheKey>> = self
            .cache
            .iter()
            .filter(|(_, entry)| &*entry.source_id == source_id)
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key.as_ref()).await;
        }
        keys.len()
    }

    /// Remove expired entries, returning how many were removed
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let keys: Vec<Arc<CacheKey>> = self
            .cache
            .iter()
            .filter(|(_, entry)| is_expired(entry.expires_at, now))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key.as_ref()).await;
        }
        keys.len()
    }

    /// Drop everything, returning the number of entries that were present
    pub async fn clear(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        let count = self.cache.entry_count();
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        count
    }

    /// Whether the key is present, ignoring expiry and without touching recency
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Counter and utilization snapshot
    pub async fn stats(&self) -> HotTierStats {
        self.cache.run_pending_tasks().await;
        HotTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
            weighted_bytes: self.cache.weighted_size(),
            max_bytes: self.max_bytes,
        }
    }

    /// Round-trip probe
    pub async fn health_check(&self) -> bool {
        let key = crate::key::KeyCodec::encode("__health__", "hot", &crate::key::Params::new());
        let probe = serde_json::json!({"test": true});
        let expires_at = self.clock.now() + chrono::TimeDelta::seconds(60);
        self.put(
            key,
            HotEntry::new(Arc::new(probe.clone()), "__health__", None, expires_at, 16),
        )
        .await;
        let ok = self.get(&key).await.is_some_and(|e| *e.value == probe);
        self.evict(&key).await;
        ok
    }
}
