//! Administrative operations
//!
//! Backing for the `mdcache` tool. Every operation returns a report struct
//! instead of printing. Rows that fail to decode are listed in the report and
//! skipped; they never abort the whole operation.

use crate::backends::SourceSummary;
use crate::cache_manager::{CacheManager, CacheStats, PutOptions};
use crate::error::{CacheError, CacheResult};
use crate::invalidation::Removed;
use crate::key::Params;
use crate::stats::{LatencyHistogram, LatencySummary};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// Source id used for synthetic benchmark entries
pub const BENCHMARK_SOURCE: &str = "__benchmark__";

const BENCHMARK_TTL: Duration = Duration::from_secs(3600);

/// A stored entry with its payload decoded
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub key: String,
    pub source_id: String,
    pub operation: String,
    pub params: Params,
    pub version_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub stored_bytes: u64,
    pub compressed: bool,
    pub hit_count: u64,
    pub value: Value,
}

/// A row that could not be turned into an [`EntryView`]
#[derive(Debug, Clone, Serialize)]
pub struct DecodeFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub source_id: String,
    pub entries: Vec<EntryView>,
    pub decode_failures: Vec<DecodeFailure>,
    /// More live entries exist beyond `limit`
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearExpiredReport {
    pub removed: Removed,
    /// Expired warm rows per source, counted just before the sweep
    pub per_source: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub source_id: String,
    pub removed: Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub sources: Vec<SourceSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub exported: u64,
    pub per_source: BTreeMap<String, u64>,
    pub decode_failures: Vec<DecodeFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub iterations: u32,
    pub write: LatencySummary,
    pub hot_read: LatencySummary,
    pub warm_read: LatencySummary,
}

/// One JSON Lines record of an export
#[derive(Serialize)]
struct ExportRecord<'a> {
    key: String,
    source_id: &'a str,
    operation: &'a str,
    params: &'a Params,
    version_tag: Option<&'a str>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hit_count: u64,
    value: Value,
}

fn failure(key: String, error: &CacheError) -> DecodeFailure {
    let reason = match error {
        CacheError::CorruptEntry { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    DecodeFailure { key, reason }
}

fn corrupt_key(error: &CacheError) -> String {
    match error {
        CacheError::CorruptEntry { key, .. } => key.clone(),
        _ => String::new(),
    }
}

impl CacheManager {
    /// Up to `limit` live entries of one source, in key order
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be read.
    pub async fn inspect(&self, source_id: &str, limit: usize) -> CacheResult<InspectReport> {
        let mut rows = self.warm.iterate(Some(source_id.to_string()));
        let mut report = InspectReport {
            source_id: source_id.to_string(),
            entries: Vec::new(),
            decode_failures: Vec::new(),
            truncated: false,
        };

        while let Some(row) = rows.next().await {
            if report.entries.len() >= limit {
                report.truncated = true;
                break;
            }
            let entry = match row {
                Ok(entry) => entry,
                Err(e @ CacheError::CorruptEntry { .. }) => {
                    report.decode_failures.push(failure(corrupt_key(&e), &e));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let key = entry.key.to_hex();
            match self.envelope.decode::<Value>(&key, &entry.payload, entry.compressed) {
                Ok(value) => report.entries.push(EntryView {
                    key,
                    stored_bytes: entry.payload.len() as u64,
                    source_id: entry.source_id,
                    operation: entry.operation,
                    params: entry.params,
                    version_tag: entry.version_tag,
                    created_at: entry.created_at,
                    expires_at: entry.expires_at,
                    size_bytes: entry.size_bytes,
                    compressed: entry.compressed,
                    hit_count: entry.hit_count,
                    value,
                }),
                Err(e) => report.decode_failures.push(failure(key, &e)),
            }
        }
        Ok(report)
    }

    /// Sweep expired entries now, reporting what each source lost
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn clear_expired(&self) -> CacheResult<ClearExpiredReport> {
        let per_source = self
            .warm
            .source_summary()
            .await?
            .into_iter()
            .filter(|s| s.entries > s.live_entries)
            .map(|s| (s.source_id, s.entries - s.live_entries))
            .collect();
        let removed = self.sweep_expired().await?;
        info!(warm = removed.warm, hot = removed.hot, "Cleared expired entries");
        Ok(ClearExpiredReport { removed, per_source })
    }

    /// Purge one source from both tiers
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be written.
    pub async fn purge_source_report(&self, source_id: &str) -> CacheResult<PurgeReport> {
        let removed = self.purge_source(source_id).await?;
        Ok(PurgeReport {
            source_id: source_id.to_string(),
            removed,
        })
    }

    /// [`stats`](Self::stats) plus the warm tier's per-source breakdown
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be read.
    pub async fn stats_report(&self) -> CacheResult<StatsReport> {
        Ok(StatsReport {
            sources: self.warm.source_summary().await?,
            cache: self.stats().await,
        })
    }

    /// Write live entries as JSON Lines, one object per entry
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier cannot be read; `Serialization` if
    /// the output cannot be written.
    pub async fn export<W>(&self, source_filter: Option<&str>, out: &mut W) -> CacheResult<ExportReport>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rows = self.warm.iterate(source_filter.map(str::to_string));
        let mut report = ExportReport::default();
        let io_err = |e: std::io::Error| CacheError::Serialization(format!("export write failed: {e}"));

        while let Some(row) = rows.next().await {
            let entry = match row {
                Ok(entry) => entry,
                Err(e @ CacheError::CorruptEntry { .. }) => {
                    report.decode_failures.push(failure(corrupt_key(&e), &e));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let key = entry.key.to_hex();
            let value = match self.envelope.decode::<Value>(&key, &entry.payload, entry.compressed) {
                Ok(value) => value,
                Err(e) => {
                    report.decode_failures.push(failure(key, &e));
                    continue;
                }
            };

            let mut line = serde_json::to_vec(&ExportRecord {
                key,
                source_id: &entry.source_id,
                operation: &entry.operation,
                params: &entry.params,
                version_tag: entry.version_tag.as_deref(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                hit_count: entry.hit_count,
                value,
            })?;
            line.push(b'\n');
            out.write_all(&line).await.map_err(io_err)?;

            report.exported += 1;
            *report.per_source.entry(entry.source_id).or_default() += 1;
        }
        out.flush().await.map_err(io_err)?;

        if !report.decode_failures.is_empty() {
            warn!(failures = report.decode_failures.len(), "Export skipped undecodable entries");
        }
        info!(exported = report.exported, "Export finished");
        Ok(report)
    }

    /// Time writes, hot reads and warm reads of synthetic entries.
    ///
    /// Entries live under [`BENCHMARK_SOURCE`] and are purged afterwards.
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the warm tier rejects a write.
    pub async fn benchmark(&self, iterations: u32) -> CacheResult<BenchmarkReport> {
        let write = LatencyHistogram::default();
        let hot_read = LatencyHistogram::default();
        let warm_read = LatencyHistogram::default();

        let requests: Vec<Params> = (0..iterations)
            .map(|i| Params::new().with("iteration", i))
            .collect();
        let body = serde_json::json!({
            "bids": (0..32).map(|level| [100.0 - f64::from(level) * 0.01, 1.5]).collect::<Vec<_>>(),
            "asks": (0..32).map(|level| [100.0 + f64::from(level) * 0.01, 1.5]).collect::<Vec<_>>(),
        });
        let options = PutOptions {
            version_tag: None,
            ttl_override: Some(BENCHMARK_TTL),
        };

        let result = async {
            for params in &requests {
                let started = Instant::now();
                self.put(BENCHMARK_SOURCE, "book", params, &body, options.clone())
                    .await?;
                write.record(started.elapsed());
            }
            for params in &requests {
                let started = Instant::now();
                if self.peek(BENCHMARK_SOURCE, "book", params).await.is_some() {
                    hot_read.record(started.elapsed());
                }
            }
            self.hot.evict_source(BENCHMARK_SOURCE).await;
            for params in &requests {
                let started = Instant::now();
                if self.peek(BENCHMARK_SOURCE, "book", params).await.is_some() {
                    warm_read.record(started.elapsed());
                }
            }
            Ok::<_, CacheError>(())
        }
        .await;

        if let Err(e) = self.purge_source(BENCHMARK_SOURCE).await {
            warn!(error = %e, "Failed to remove benchmark entries");
        }
        result?;

        Ok(BenchmarkReport {
            iterations,
            write: write.summary(),
            hot_read: hot_read.summary(),
            warm_read: warm_read.summary(),
        })
    }
}
