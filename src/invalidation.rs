//! Cache invalidation
//!
//! Three mechanisms share this module:
//!
//! - **Time-based**: the periodic sweep deletes rows whose expiry has been
//!   reached, using the same predicate as lazy expiry on reads.
//! - **Version-based**: before a cold-fetched value is written, a stored entry
//!   carrying a different upstream version tag is dropped from both tiers.
//! - **Manual**: purge by key, by source, or everything.
//!
//! Purges are fenced against in-flight write-backs and promotions. Writers
//! capture an [`EpochTicket`] before their warm read or cold fetch and only
//! write while holding the shared side of the write gate with a ticket that
//! is still current. A purge takes the exclusive side, bumps the epoch, then
//! clears both tiers, so once it returns no stale result can land in either tier.

use crate::backends::{HotTier, WarmTier};
use crate::error::CacheResult;
use crate::key::CacheKey;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a manual purge removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    /// One key belonging to `source_id`
    Key { source_id: String, key: CacheKey },
    /// Every entry of one source
    Source(String),
    /// Everything
    All,
}

impl PurgeScope {
    fn label(&self) -> String {
        match self {
            Self::Key { key, .. } => format!("key {key}"),
            Self::Source(source) => format!("source {source}"),
            Self::All => "all entries".to_string(),
        }
    }
}

/// Rows and entries removed by a purge or sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Removed {
    pub warm: u64,
    pub hot: u64,
}

/// Epochs observed before a warm read or cold fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochTicket {
    global: u64,
    source: u64,
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct InvalidationStats {
    pub sweeps: u64,
    pub swept_rows: u64,
    pub version_invalidations: u64,
    pub purges: u64,
    pub purged_rows: u64,
    /// Write-backs or promotions dropped because a purge overtook them
    pub fenced_writes: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
struct AtomicInvalidationStats {
    sweeps: AtomicU64,
    swept_rows: AtomicU64,
    version_invalidations: AtomicU64,
    purges: AtomicU64,
    purged_rows: AtomicU64,
    fenced_writes: AtomicU64,
}

impl AtomicInvalidationStats {
    fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            swept_rows: self.swept_rows.load(Ordering::Relaxed),
            version_invalidations: self.version_invalidations.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            purged_rows: self.purged_rows.load(Ordering::Relaxed),
            fenced_writes: self.fenced_writes.load(Ordering::Relaxed),
        }
    }
}

/// Coordinates expiry, version checks and purges across both tiers
pub struct InvalidationManager {
    hot: Arc<HotTier>,
    warm: WarmTier,
    write_gate: RwLock<()>,
    global_epoch: AtomicU64,
    source_epochs: DashMap<String, u64>,
    stats: AtomicInvalidationStats,
}

impl InvalidationManager {
    #[must_use]
    pub fn new(hot: Arc<HotTier>, warm: WarmTier) -> Self {
        Self {
            hot,
            warm,
            write_gate: RwLock::new(()),
            global_epoch: AtomicU64::new(0),
            source_epochs: DashMap::new(),
            stats: AtomicInvalidationStats::default(),
        }
    }

    fn source_epoch(&self, source_id: &str) -> u64 {
        self.source_epochs.get(source_id).map_or(0, |e| *e.value())
    }

    /// Capture the current epochs for `source_id`
    #[must_use]
    pub fn ticket(&self, source_id: &str) -> EpochTicket {
        EpochTicket {
            global: self.global_epoch.load(Ordering::Acquire),
            source: self.source_epoch(source_id),
        }
    }

    /// Run `write` unless a purge touching `source_id` happened after `ticket`
    /// was taken. Returns `None` when the write was fenced off.
    pub async fn fenced_write<F, Fut, T>(&self, source_id: &str, ticket: EpochTicket, write: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _shared = self.write_gate.read().await;
        if self.ticket(source_id) != ticket {
            self.stats.fenced_writes.fetch_add(1, Ordering::Relaxed);
            debug!(source = %source_id, "Write skipped, a purge overtook it");
            return None;
        }
        Some(write().await)
    }

    /// Remove entries from both tiers.
    ///
    /// Hot entries are evicted even when the warm delete fails.
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn purge(&self, scope: PurgeScope) -> CacheResult<Removed> {
        let _exclusive = self.write_gate.write().await;

        match &scope {
            PurgeScope::Key { source_id, .. } | PurgeScope::Source(source_id) => {
                *self.source_epochs.entry(source_id.clone()).or_insert(0) += 1;
            }
            PurgeScope::All => {
                self.global_epoch.fetch_add(1, Ordering::AcqRel);
            }
        }

        let (warm, hot) = match &scope {
            PurgeScope::Key { key, .. } => {
                let warm = self.warm.delete(key).await.map(u64::from);
                let present = self.hot.contains(key);
                self.hot.evict(key).await;
                (warm, u64::from(present))
            }
            PurgeScope::Source(source_id) => {
                let warm = self.warm.delete_by_source(source_id).await.map(|n| n as u64);
                (warm, self.hot.evict_source(source_id).await as u64)
            }
            PurgeScope::All => {
                let warm = self.warm.clear_all().await.map(|n| n as u64);
                (warm, self.hot.clear().await)
            }
        };

        let warm = warm.inspect_err(|e| {
            warn!(scope = %scope.label(), error = %e, "Purge could not reach the warm tier");
        })?;

        self.stats.purges.fetch_add(1, Ordering::Relaxed);
        self.stats.purged_rows.fetch_add(warm, Ordering::Relaxed);
        info!(scope = %scope.label(), warm, hot, "Purged cache entries");
        Ok(Removed { warm, hot })
    }

    /// Drop the stored entry for `key` if its version tag differs from the
    /// freshly fetched one. A `None` fetched tag means the source has no
    /// versioning and nothing happens. Returns whether an entry was dropped.
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be read or written.
    pub async fn check_version(&self, key: &CacheKey, fetched_tag: Option<&str>) -> CacheResult<bool> {
        let Some(fetched_tag) = fetched_tag else {
            return Ok(false);
        };
        let Some(stored) = self.warm.peek_raw(key).await? else {
            return Ok(false);
        };
        if stored.version_tag.as_deref() == Some(fetched_tag) {
            return Ok(false);
        }

        self.warm.delete(key).await?;
        self.hot.evict(key).await;
        self.stats.version_invalidations.fetch_add(1, Ordering::Relaxed);
        info!(
            key = %key,
            source = %stored.source_id,
            stored = stored.version_tag.as_deref().unwrap_or("<none>"),
            fetched = fetched_tag,
            "Upstream version changed, invalidated stored entry"
        );
        Ok(true)
    }

    /// Delete expired rows from the warm tier and expired entries from the hot tier
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn sweep_expired(&self) -> CacheResult<Removed> {
        let warm = self.warm.clear_expired().await? as u64;
        let hot = self.hot.evict_expired().await as u64;

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats.swept_rows.fetch_add(warm, Ordering::Relaxed);
        if warm > 0 || hot > 0 {
            info!(warm, hot, "Expiry sweep removed entries");
        } else {
            debug!("Expiry sweep found nothing to remove");
        }
        Ok(Removed { warm, hot })
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("Expiry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.sweep_expired().await {
                            error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HotEntry;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{HotTierConfig, WarmTierConfig};
    use crate::entry::CacheEntry;
    use crate::key::{KeyCodec, Params};
    use bytes::Bytes;
    use chrono::TimeDelta;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        hot: Arc<HotTier>,
        warm: WarmTier,
        manager: InvalidationManager,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::starting_now());
        let hot = Arc::new(HotTier::new(HotTierConfig::default(), clock.clone()));
        let warm = WarmTier::open(&WarmTierConfig::at(dir.path().join("warm.db")), clock.clone())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let manager = InvalidationManager::new(Arc::clone(&hot), warm.clone());
        Fixture {
            _dir: dir,
            clock,
            hot,
            warm,
            manager,
        }
    }

    async fn store(f: &Fixture, source: &str, i: i64, tag: Option<&str>, ttl: TimeDelta) -> CacheKey {
        let params = Params::new().with("i", i);
        let key = KeyCodec::encode(source, "op", &params);
        let now = f.clock.now();
        f.warm
            .put(CacheEntry {
                key,
                source_id: source.into(),
                operation: "op".into(),
                params,
                payload: Bytes::from_static(b"x"),
                compressed: false,
                version_tag: tag.map(str::to_string),
                created_at: now,
                expires_at: now + ttl,
                size_bytes: 1,
                hit_count: 0,
            })
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        f.hot
            .put(key, HotEntry::new(Arc::new(serde_json::json!(i)), source, tag, now + ttl, 1))
            .await;
        key
    }

    #[tokio::test]
    async fn test_purge_source_clears_both_tiers() {
        let f = fixture().await;
        let a = store(&f, "a", 1, None, TimeDelta::hours(1)).await;
        let b = store(&f, "b", 1, None, TimeDelta::hours(1)).await;

        let removed = f
            .manager
            .purge(PurgeScope::Source("a".into()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(removed, Removed { warm: 1, hot: 1 });
        assert!(!f.hot.contains(&a));
        assert!(f.warm.get(&a).await.unwrap_or_else(|e| panic!("{e}")).is_none());
        assert!(f.hot.contains(&b));
    }

    #[tokio::test]
    async fn test_purge_fences_writes_holding_old_tickets() {
        let f = fixture().await;
        let ticket_a = f.manager.ticket("a");
        let ticket_b = f.manager.ticket("b");

        f.manager
            .purge(PurgeScope::Source("a".into()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert!(f.manager.fenced_write("a", ticket_a, || async {}).await.is_none());
        assert!(f.manager.fenced_write("b", ticket_b, || async {}).await.is_some());

        f.manager.purge(PurgeScope::All).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(f.manager.fenced_write("b", ticket_b, || async {}).await.is_none());
        assert_eq!(f.manager.stats().fenced_writes, 2);
    }

    #[tokio::test]
    async fn test_version_change_drops_unexpired_entry() {
        let f = fixture().await;
        let key = store(&f, "s", 1, Some("v1"), TimeDelta::days(7)).await;

        assert!(!f.manager.check_version(&key, None).await.unwrap_or_else(|e| panic!("{e}")));
        assert!(!f.manager.check_version(&key, Some("v1")).await.unwrap_or_else(|e| panic!("{e}")));
        assert!(f.manager.check_version(&key, Some("v2")).await.unwrap_or_else(|e| panic!("{e}")));

        assert!(!f.hot.contains(&key));
        assert!(f.warm.peek_raw(&key).await.unwrap_or_else(|e| panic!("{e}")).is_none());
        assert_eq!(f.manager.stats().version_invalidations, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let f = fixture().await;
        store(&f, "s", 1, None, TimeDelta::seconds(1)).await;
        let live = store(&f, "s", 2, None, TimeDelta::hours(1)).await;

        f.clock.advance(Duration::from_secs(1));
        let removed = f.manager.sweep_expired().await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(removed, Removed { warm: 1, hot: 1 });
        assert!(f.hot.contains(&live));

        // Idempotent
        let again = f.manager.sweep_expired().await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(again, Removed::default());
    }
}
