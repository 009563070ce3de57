//! Stored cache entry and the shared expiry predicate

use crate::key::{CacheKey, Params};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The one expiry rule: an entry is dead once `now` reaches `expires_at`.
///
/// Lazy expiry on reads and the periodic sweep (`expires_at <= now` in SQL)
/// both implement exactly this predicate.
#[must_use]
pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at <= now
}

/// One stored response.
///
/// Immutable once written: a refresh writes a replacement entry with a new
/// `created_at` rather than mutating this one.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub source_id: String,
    /// Operation and canonical parameters the key was derived from
    pub operation: String,
    pub params: Params,
    /// Envelope bytes
    pub payload: Bytes,
    pub compressed: bool,
    pub version_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Uncompressed payload size; `payload.len()` is the stored size
    pub size_bytes: u64,
    pub hit_count: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }

    /// Time left before expiry, zero if already expired
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        assert!(is_expired(now, now));
        assert!(is_expired(now - TimeDelta::milliseconds(1), now));
        assert!(!is_expired(now + TimeDelta::milliseconds(1), now));
    }
}
