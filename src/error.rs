//! Error taxonomy
//!
//! A cache miss is not an error: lookups return `Option::None`. Everything
//! else that can go wrong is a [`CacheError`], and failures reported by the
//! cold fetcher gate are a [`FetchError`].
//!
//! Both types are `Clone` so the single-flight layer can hand the same
//! failure to every caller waiting on one in-flight fetch.

use std::time::Duration;
use thiserror::Error;

/// Storage layer named in `TierUnavailable` errors and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-process LRU tier
    Hot,
    /// Persistent SQLite tier
    Warm,
    /// The external source behind the cold fetcher gate
    Cold,
}

impl Tier {
    /// Lowercase tier name used in logs and reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a connector or by the per-source rate limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Temporary upstream failure (timeouts, 5xx); worth a short retry.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Upstream rejected the request for good (bad symbol, 4xx); never retried.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),

    /// Per-source quota exhausted; callers must wait at least `retry_after`.
    #[error("source '{source_id}' is rate limited, retry after {retry_after:?}")]
    RateLimited {
        source_id: String,
        retry_after: Duration,
    },
}

impl FetchError {
    /// Whether a caller may try the same request again later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Minimum back-off for a rate-limited request
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Library-wide error type.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Stored bytes could not be decoded (version mismatch, bad compression, bad JSON).
    #[error("corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// The tier's storage cannot be read or written.
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: Tier, reason: String },

    /// Cold fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Invalid configuration detected at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A value could not be serialized or converted to the requested type.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// `prefetch.enabled` is false.
    #[error("prefetching is disabled by configuration")]
    PrefetchDisabled,

    /// No connector is registered for the source.
    #[error("no connector registered for source '{0}'")]
    UnknownSource(String),

    /// The task loading a value panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub(crate) fn warm_unavailable(reason: impl std::fmt::Display) -> Self {
        Self::TierUnavailable {
            tier: Tier::Warm,
            reason: reason.to_string(),
        }
    }

    /// The underlying fetch error, if this error came from the cold tier
    #[must_use]
    pub const fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::warm_unavailable(e)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::warm_unavailable(format!("blocking task failed: {e}"))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the crate
pub type CacheResult<T> = std::result::Result<T, CacheError>;
