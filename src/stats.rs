//! Statistics collector
//!
//! Counters per `(source_id, tier)`, bucketed latency histograms per tier,
//! degradation counters and monitoring alerts. Only the cache manager writes
//! here; everything else reads snapshots.

use crate::config::MonitoringConfig;
use crate::error::Tier;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Histogram bucket upper bounds, in microseconds
const BUCKET_BOUNDS_US: [u64; 18] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000, 10_000_000, 30_000_000,
];

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Lock-free latency histogram
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len() + 1],
    count: AtomicU64,
    total_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());
        if let Some(bucket) = self.buckets.get(idx) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding quantile `q`, in milliseconds
    #[must_use]
    pub fn quantile_ms(&self, q: f64) -> f64 {
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);

        let mut seen = 0;
        for (idx, n) in counts.iter().enumerate() {
            seen += n;
            if seen >= rank {
                let bound = BUCKET_BOUNDS_US
                    .get(idx)
                    .or_else(|| BUCKET_BOUNDS_US.last())
                    .copied()
                    .unwrap_or(0);
                return us_to_ms(bound);
            }
        }
        us_to_ms(BUCKET_BOUNDS_US.last().copied().unwrap_or(0))
    }

    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        let total_us = self.total_us.load(Ordering::Relaxed);
        LatencySummary {
            count,
            mean_ms: if count == 0 { 0.0 } else { us_to_ms(total_us / count) },
            p50_ms: self.quantile_ms(0.50),
            p95_ms: self.quantile_ms(0.95),
            p99_ms: self.quantile_ms(0.99),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Latency distribution summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    latency_us: AtomicU64,
    bytes_stored: AtomicU64,
}

/// Aggregate counters for one `(source_id, tier)` pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTierStats {
    pub source_id: String,
    pub tier: Tier,
    pub hits: u64,
    pub misses: u64,
    /// Total latency of the reads this tier served
    pub total_latency_ms: f64,
    pub bytes_stored: u64,
}

/// Which tier answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    Hot,
    Warm,
    Cold,
}

/// Monitoring threshold breach
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    LowHitRate { hit_rate: f64, threshold: f64, reads: u64 },
    HighLatency { p95_ms: f64, threshold_ms: f64, reads: u64 },
}

/// Degradation and maintenance counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounters {
    /// Warm tier unreachable, read fell through to the cold gate
    pub degraded_reads: u64,
    /// Entries dropped because they could not be decoded
    pub corrupt_entries: u64,
    /// Writes stored uncompressed after compression failed
    pub compression_fallbacks: u64,
    /// Write-backs skipped because the warm tier rejected them
    pub failed_writes: u64,
    pub failed_reads: u64,
}

/// Read-path view of the collector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    /// Reads answered by the hot or warm tier
    pub hits: u64,
    /// Reads that went to the cold gate
    pub misses: u64,
    pub hit_rate: f64,
    pub hot_hit_rate: f64,
    pub overall_latency: LatencySummary,
    pub hot_latency: LatencySummary,
    pub warm_latency: LatencySummary,
    pub cold_latency: LatencySummary,
    pub per_source: Vec<SourceTierStats>,
    pub health: HealthCounters,
}

/// Collects read-path statistics
pub struct StatsCollector {
    per_source: DashMap<(String, Tier), TierCounters>,
    overall: LatencyHistogram,
    hot: LatencyHistogram,
    warm: LatencyHistogram,
    cold: LatencyHistogram,
    reads: AtomicU64,
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    cold_reads: AtomicU64,
    failed_reads: AtomicU64,
    degraded_reads: AtomicU64,
    corrupt_entries: AtomicU64,
    compression_fallbacks: AtomicU64,
    failed_writes: AtomicU64,
    monitoring: MonitoringConfig,
    alerts: broadcast::Sender<AlertEvent>,
}

impl StatsCollector {
    #[must_use]
    pub fn new(monitoring: MonitoringConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            per_source: DashMap::new(),
            overall: LatencyHistogram::default(),
            hot: LatencyHistogram::default(),
            warm: LatencyHistogram::default(),
            cold: LatencyHistogram::default(),
            reads: AtomicU64::new(0),
            hot_hits: AtomicU64::new(0),
            warm_hits: AtomicU64::new(0),
            cold_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            corrupt_entries: AtomicU64::new(0),
            compression_fallbacks: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            monitoring,
            alerts,
        }
    }

    fn with_counters(&self, source_id: &str, tier: Tier, f: impl FnOnce(&TierCounters)) {
        if let Some(counters) = self.per_source.get(&(source_id.to_string(), tier)) {
            f(&counters);
            return;
        }
        f(&self.per_source.entry((source_id.to_string(), tier)).or_default());
    }

    /// Record a completed read and the tier that answered it.
    ///
    /// Tiers consulted before the answering one are counted as misses.
    pub fn record_read(&self, source_id: &str, served_by: ServedBy, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.overall.record(latency);

        let hit = |tier: Tier| {
            self.with_counters(source_id, tier, |c| {
                c.hits.fetch_add(1, Ordering::Relaxed);
                c.latency_us.fetch_add(us, Ordering::Relaxed);
            });
        };
        let miss = |tier: Tier| {
            self.with_counters(source_id, tier, |c| {
                c.misses.fetch_add(1, Ordering::Relaxed);
            });
        };

        match served_by {
            ServedBy::Hot => {
                self.hot_hits.fetch_add(1, Ordering::Relaxed);
                self.hot.record(latency);
                hit(Tier::Hot);
            }
            ServedBy::Warm => {
                self.warm_hits.fetch_add(1, Ordering::Relaxed);
                self.warm.record(latency);
                miss(Tier::Hot);
                hit(Tier::Warm);
            }
            ServedBy::Cold => {
                self.cold_reads.fetch_add(1, Ordering::Relaxed);
                self.cold.record(latency);
                miss(Tier::Hot);
                miss(Tier::Warm);
                hit(Tier::Cold);
            }
        }
    }

    /// Record a read that ended in an error
    pub fn record_failed_read(&self, source_id: &str) {
        self.failed_reads.fetch_add(1, Ordering::Relaxed);
        self.with_counters(source_id, Tier::Cold, |c| {
            c.misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Record bytes written to the warm tier
    pub fn record_write(&self, source_id: &str, bytes: u64) {
        self.with_counters(source_id, Tier::Warm, |c| {
            c.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        });
    }

    pub fn record_degraded_read(&self) {
        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_entry(&self) {
        self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression_fallback(&self) {
        self.compression_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn health(&self) -> HealthCounters {
        HealthCounters {
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            compression_fallbacks: self.compression_fallbacks.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let reads = self.reads.load(Ordering::Relaxed);
        let hot_hits = self.hot_hits.load(Ordering::Relaxed);
        let hits = hot_hits + self.warm_hits.load(Ordering::Relaxed);

        let mut per_source: Vec<SourceTierStats> = self
            .per_source
            .iter()
            .map(|entry| {
                let (source_id, tier) = entry.key();
                let c = entry.value();
                SourceTierStats {
                    source_id: source_id.clone(),
                    tier: *tier,
                    hits: c.hits.load(Ordering::Relaxed),
                    misses: c.misses.load(Ordering::Relaxed),
                    total_latency_ms: us_to_ms(c.latency_us.load(Ordering::Relaxed)),
                    bytes_stored: c.bytes_stored.load(Ordering::Relaxed),
                }
            })
            .collect();
        per_source.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| (a.tier as u8).cmp(&(b.tier as u8)))
        });

        StatsSnapshot {
            reads,
            hits,
            misses: self.cold_reads.load(Ordering::Relaxed),
            hit_rate: ratio(hits, reads),
            hot_hit_rate: ratio(hot_hits, reads),
            overall_latency: self.overall.summary(),
            hot_latency: self.hot.summary(),
            warm_latency: self.warm.summary(),
            cold_latency: self.cold.summary(),
            per_source,
            health: self.health(),
        }
    }

    /// Subscribe to monitoring alerts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    /// Compare current figures against the monitoring thresholds, broadcast
    /// and return any breaches. Nothing fires before `min_samples` reads.
    pub fn evaluate_alerts(&self) -> Vec<AlertEvent> {
        let reads = self.reads.load(Ordering::Relaxed);
        if reads < self.monitoring.min_samples || reads == 0 {
            return Vec::new();
        }

        let mut events = Vec::new();
        let hits = self.hot_hits.load(Ordering::Relaxed) + self.warm_hits.load(Ordering::Relaxed);
        let hit_rate = ratio(hits, reads);
        if hit_rate < self.monitoring.min_hit_rate {
            events.push(AlertEvent::LowHitRate {
                hit_rate,
                threshold: self.monitoring.min_hit_rate,
                reads,
            });
        }
        let p95_ms = self.overall.quantile_ms(0.95);
        if p95_ms > self.monitoring.max_latency_ms {
            events.push(AlertEvent::HighLatency {
                p95_ms,
                threshold_ms: self.monitoring.max_latency_ms,
                reads,
            });
        }

        for event in &events {
            warn!(alert = ?event, "Cache monitoring threshold breached");
            // No subscribers is fine
            let _ = self.alerts.send(event.clone());
        }
        events
    }
}
