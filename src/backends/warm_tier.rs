//! Warm Tier - SQLite Persistent Cache
//!
//! One row per cache key in a WAL-journaled SQLite database. A single writer
//! connection serializes mutations; a small pool of read-only connections
//! serves lookups concurrently with writes. Every call runs on tokio's
//! blocking pool.
//!
//! Writes use `synchronous = FULL`, so a put that returned is durable and a
//! crash mid-write leaves either the old row or the new one, never a mix.

use crate::clock::Clock;
use crate::config::WarmTierConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, Params};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Rows fetched per page by [`WarmTier::iterate`]
const ITER_PAGE: usize = 256;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    params_json TEXT NOT NULL,
    payload BLOB NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    version_tag TEXT,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_source ON cache_entries(source_id);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at_ms);
";

const SELECT_COLUMNS: &str = "key, source_id, operation, params_json, payload, compressed, \
     version_tag, created_at_ms, expires_at_ms, size_bytes, hit_count";

/// Per-source row counts for the admin surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub entries: u64,
    pub live_entries: u64,
    pub payload_bytes: u64,
}

/// Warm tier footprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmStorage {
    pub entries: u64,
    pub payload_bytes: u64,
    /// Database file size (page count times page size)
    pub file_bytes: u64,
}

/// A row exactly as stored, before validation
struct StoredRow {
    key: String,
    source_id: String,
    operation: String,
    params_json: String,
    payload: Vec<u8>,
    compressed: bool,
    version_tag: Option<String>,
    created_at_ms: i64,
    expires_at_ms: i64,
    size_bytes: i64,
    hit_count: i64,
}

impl StoredRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            source_id: row.get(1)?,
            operation: row.get(2)?,
            params_json: row.get(3)?,
            payload: row.get(4)?,
            compressed: row.get(5)?,
            version_tag: row.get(6)?,
            created_at_ms: row.get(7)?,
            expires_at_ms: row.get(8)?,
            size_bytes: row.get(9)?,
            hit_count: row.get(10)?,
        })
    }

    fn into_entry(self) -> CacheResult<CacheEntry> {
        let corrupt = |reason: String| CacheError::CorruptEntry {
            key: self.key.clone(),
            reason,
        };
        let key: CacheKey = self
            .key
            .parse()
            .map_err(|e| corrupt(format!("malformed key: {e}")))?;
        let params: Params = serde_json::from_str(&self.params_json)
            .map_err(|e| corrupt(format!("malformed params: {e}")))?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(self.created_at_ms)
            .ok_or_else(|| corrupt(format!("created_at {} out of range", self.created_at_ms)))?;
        let expires_at = DateTime::<Utc>::from_timestamp_millis(self.expires_at_ms)
            .ok_or_else(|| corrupt(format!("expires_at {} out of range", self.expires_at_ms)))?;

        Ok(CacheEntry {
            key,
            source_id: self.source_id,
            operation: self.operation,
            params,
            payload: Bytes::from(self.payload),
            compressed: self.compressed,
            version_tag: self.version_tag,
            created_at,
            expires_at,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or(0),
            hit_count: u64::try_from(self.hit_count).unwrap_or(0),
        })
    }
}

struct Connections {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Connections {
    fn reader(&self) -> MutexGuard<'_, Connection> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len().max(1);
        self.readers.get(idx).map_or_else(|| self.writer.lock(), Mutex::lock)
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }
}

/// SQLite-backed warm tier
#[derive(Clone)]
pub struct WarmTier {
    conns: Arc<Connections>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl std::fmt::Debug for WarmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmTier").field("path", &self.path).finish_non_exhaustive()
    }
}

fn configure(conn: &Connection, config: &WarmTierConfig) -> rusqlite::Result<()> {
    conn.busy_timeout(config.busy_timeout())?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}

impl WarmTier {
    /// Open (creating if needed) the database at `config.path`
    ///
    /// # Errors
    ///
    /// `TierUnavailable` if the directory or database cannot be created or
    /// the schema cannot be applied.
    pub async fn open(config: &WarmTierConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let config = config.clone();
        let path = config.path.clone();
        let conns = tokio::task::spawn_blocking(move || Self::open_blocking(&config)).await??;

        info!(path = %path.display(), readers = conns.readers.len(), "Warm tier initialized (SQLite, WAL)");

        Ok(Self {
            conns: Arc::new(conns),
            clock,
            path,
        })
    }

    fn open_blocking(config: &WarmTierConfig) -> CacheResult<Connections> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::warm_unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let writer = Connection::open(&config.path)?;
        let mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(mode = %mode, "SQLite refused WAL journal mode");
        }
        configure(&writer, config)?;
        writer.execute_batch(SCHEMA)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let readers = (0..config.reader_connections)
            .map(|_| -> rusqlite::Result<Mutex<Connection>> {
                let conn = Connection::open_with_flags(&config.path, flags)?;
                conn.busy_timeout(config.busy_timeout())?;
                Ok(Mutex::new(conn))
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Connections {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_reader<T, F>(&self, f: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> CacheResult<T> + Send + 'static,
    {
        let conns = Arc::clone(&self.conns);
        tokio::task::spawn_blocking(move || f(&conns.reader())).await?
    }

    async fn with_writer<T, F>(&self, f: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> CacheResult<T> + Send + 'static,
    {
        let conns = Arc::clone(&self.conns);
        tokio::task::spawn_blocking(move || f(&conns.writer())).await?
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Live entry for `key`.
    ///
    /// An expired row reads as absent and is deleted on the way out.
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure, `CorruptEntry` if the row itself
    /// cannot be interpreted.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let now_ms = self.now_ms();
        let Some(entry) = self.peek_raw(key).await? else {
            return Ok(None);
        };
        if entry.expires_at.timestamp_millis() > now_ms {
            return Ok(Some(entry));
        }

        let hex = key.to_hex();
        debug!(key = %hex, "[Warm] Lazily expiring entry");
        self.with_writer(move |conn| {
            // Only if still expired: a concurrent write may have replaced it
            conn.execute(
                "DELETE FROM cache_entries WHERE key = ?1 AND expires_at_ms <= ?2",
                params![hex, now_ms],
            )?;
            Ok(())
        })
        .await?;
        Ok(None)
    }

    /// Stored entry for `key` regardless of expiry
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn peek_raw(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let hex = key.to_hex();
        let row = self
            .with_reader(move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM cache_entries WHERE key = ?1");
                Ok(conn.query_row(&sql, params![hex], StoredRow::read).optional()?)
            })
            .await?;
        row.map(StoredRow::into_entry).transpose()
    }

    /// Whether an unexpired entry exists, without decoding it
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn contains_live(&self, key: &CacheKey) -> CacheResult<bool> {
        let hex = key.to_hex();
        let now_ms = self.now_ms();
        self.with_reader(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM cache_entries WHERE key = ?1 AND expires_at_ms > ?2",
                    params![hex, now_ms],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Insert or replace the row for `entry.key`
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure (disk full, locked past the busy
    /// timeout, read-only file).
    pub async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let params_json = serde_json::to_string(&entry.params)?;
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (key, source_id, operation, params_json, payload, compressed, version_tag,
                  created_at_ms, expires_at_ms, size_bytes, hit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.key.to_hex(),
                    entry.source_id,
                    entry.operation,
                    params_json,
                    entry.payload.as_ref(),
                    entry.compressed,
                    entry.version_tag,
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis(),
                    i64::try_from(entry.size_bytes).unwrap_or(i64::MAX),
                    i64::try_from(entry.hit_count).unwrap_or(i64::MAX),
                ],
            )?;
            debug!(key = %entry.key, source = %entry.source_id, "[Warm] Stored entry");
            Ok(())
        })
        .await
    }

    /// Delete one key, reporting whether a row existed
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let hex = key.to_hex();
        self.with_writer(move |conn| {
            Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![hex])? > 0)
        })
        .await
    }

    /// Delete every row for `source_id`, returning the count
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn delete_by_source(&self, source_id: &str) -> CacheResult<usize> {
        let source_id = source_id.to_string();
        self.with_writer(move |conn| {
            Ok(conn.execute("DELETE FROM cache_entries WHERE source_id = ?1", params![source_id])?)
        })
        .await
    }

    /// Delete every row, returning the count
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn clear_all(&self) -> CacheResult<usize> {
        self.with_writer(|conn| Ok(conn.execute("DELETE FROM cache_entries", [])?))
            .await
    }

    /// Delete rows whose expiry has been reached, returning the count
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn clear_expired(&self) -> CacheResult<usize> {
        let now_ms = self.now_ms();
        self.with_writer(move |conn| {
            Ok(conn.execute(
                "DELETE FROM cache_entries WHERE expires_at_ms <= ?1",
                params![now_ms],
            )?)
        })
        .await
    }

    /// Bump the persisted hit counter
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn record_hit(&self, key: &CacheKey) -> CacheResult<()> {
        let hex = key.to_hex();
        self.with_writer(move |conn| {
            conn.execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1 WHERE key = ?1",
                params![hex],
            )?;
            Ok(())
        })
        .await
    }

    /// Stream live entries, optionally for one source, in key order.
    ///
    /// Rows are read in pages, so the stream never holds a connection while
    /// the consumer is working. Entries written during iteration may or may
    /// not be seen; each yielded entry is a complete row.
    #[must_use]
    pub fn iterate(&self, source_filter: Option<String>) -> BoxStream<'static, CacheResult<CacheEntry>> {
        let tier = self.clone();
        stream::unfold(Some(String::new()), move |cursor| {
            let tier = tier.clone();
            let filter = source_filter.clone();
            async move {
                let after = cursor?;
                match tier.live_page(filter, after).await {
                    Ok(rows) => {
                        let next = if rows.len() < ITER_PAGE {
                            None
                        } else {
                            rows.last().map(|r| r.key.clone())
                        };
                        Some((Ok(rows), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .flat_map(|page| match page {
            Ok(rows) => stream::iter(rows.into_iter().map(StoredRow::into_entry)).left_stream(),
            Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
        })
        .boxed()
    }

    async fn live_page(&self, source_filter: Option<String>, after: String) -> CacheResult<Vec<StoredRow>> {
        let now_ms = self.now_ms();
        self.with_reader(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM cache_entries
                 WHERE key > ?1 AND expires_at_ms > ?2 AND (?3 IS NULL OR source_id = ?3)
                 ORDER BY key LIMIT ?4"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(
                    params![after, now_ms, source_filter, i64::try_from(ITER_PAGE).unwrap_or(256)],
                    StoredRow::read,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Row counts and payload bytes per source
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn source_summary(&self) -> CacheResult<Vec<SourceSummary>> {
        let now_ms = self.now_ms();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_id, COUNT(*), SUM(CASE WHEN expires_at_ms > ?1 THEN 1 ELSE 0 END),
                        COALESCE(SUM(length(payload)), 0)
                 FROM cache_entries GROUP BY source_id ORDER BY source_id",
            )?;
            let rows = stmt
                .query_map(params![now_ms], |row| {
                    Ok(SourceSummary {
                        source_id: row.get(0)?,
                        entries: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                        live_entries: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        payload_bytes: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Entry count, payload bytes and file size
    ///
    /// # Errors
    ///
    /// `TierUnavailable` on storage failure.
    pub async fn storage(&self) -> CacheResult<WarmStorage> {
        self.with_reader(|conn| {
            let (entries, payload_bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(length(payload)), 0) FROM cache_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok(WarmStorage {
                entries: u64::try_from(entries).unwrap_or(0),
                payload_bytes: u64::try_from(payload_bytes).unwrap_or(0),
                file_bytes: u64::try_from(page_count.saturating_mul(page_size)).unwrap_or(0),
            })
        })
        .await
    }

    /// Whether both the writer and a reader answer
    pub async fn health_check(&self) -> bool {
        let read = self
            .with_reader(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        let write = self
            .with_writer(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        matches!((read, write), (Ok(1), Ok(1)))
    }
}
