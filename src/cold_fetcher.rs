//! Cold fetcher gate
//!
//! The only path to external sources. Routes each request to the connector
//! registered for its source, enforces the source's request budget with a
//! GCRA limiter (governor), and retries transient failures with doubling,
//! jittered back-off. An exhausted budget fails fast with `RateLimited` carrying the
//! wait time; it never queues the caller.

use crate::config::{FetchConfig, RateLimitConfig};
use crate::error::{CacheError, CacheResult, FetchError};
use crate::key::Params;
use crate::traits::{Connector, FetchResponse};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type SourceLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn quota_for(source_id: &str, limit: RateLimitConfig) -> CacheResult<Quota> {
    let invalid = || CacheError::Config(format!("rate_limits.{source_id}: invalid budget {limit:?}"));
    let burst = NonZeroU32::new(limit.requests).ok_or_else(invalid)?;
    let period = Duration::try_from_secs_f64(limit.per_secs / f64::from(limit.requests))
        .map_err(|_| invalid())?;
    Ok(Quota::with_period(period).ok_or_else(invalid)?.allow_burst(burst))
}

/// Gate call counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ColdFetchStats {
    pub requests: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub transient_retries: u64,
}

/// Connector registry plus per-source limiters
pub struct ColdFetcher {
    connectors: DashMap<String, Arc<dyn Connector>>,
    limiters: HashMap<String, SourceLimiter>,
    policy: FetchConfig,
    requests: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    retries: AtomicU64,
}

impl ColdFetcher {
    /// Build limiters for every configured budget
    ///
    /// # Errors
    ///
    /// `CacheError::Config` if a budget cannot be expressed as a quota.
    pub fn new(policy: FetchConfig, rate_limits: &HashMap<String, RateLimitConfig>) -> CacheResult<Self> {
        let limiters = rate_limits
            .iter()
            .map(|(source, limit)| -> CacheResult<(String, SourceLimiter)> {
                Ok((source.clone(), RateLimiter::direct(quota_for(source, *limit)?)))
            })
            .collect::<CacheResult<HashMap<_, _>>>()?;

        Ok(Self {
            connectors: DashMap::new(),
            limiters,
            policy,
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    /// Register (or replace) the connector for `source_id`
    pub fn register(&self, source_id: impl Into<String>, connector: Arc<dyn Connector>) {
        let source_id = source_id.into();
        debug!(source = %source_id, connector = connector.name(), "Registered connector");
        self.connectors.insert(source_id, connector);
    }

    #[must_use]
    pub fn has_source(&self, source_id: &str) -> bool {
        self.connectors.contains_key(source_id)
    }

    /// Registered source ids, sorted
    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.connectors.iter().map(|e| e.key().clone()).collect();
        sources.sort();
        sources
    }

    /// Take one token from the source's budget, or report how long to wait
    fn admit(&self, source_id: &str) -> Result<(), FetchError> {
        let Some(limiter) = self.limiters.get(source_id) else {
            return Ok(());
        };
        limiter.check().map_err(|not_until| {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            let retry_after =
                not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
            debug!(source = %source_id, ?retry_after, "Source budget exhausted");
            FetchError::RateLimited {
                source_id: source_id.to_string(),
                retry_after,
            }
        })
    }

    /// Fetch from the source's connector under its budget
    ///
    /// # Errors
    ///
    /// - `UnknownSource` if no connector is registered
    /// - `Fetch(RateLimited)` when the budget is exhausted, including on a retry
    /// - `Fetch(Transient)` once the retry allowance is spent
    /// - `Fetch(Permanent)` immediately
    pub async fn fetch(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<FetchResponse> {
        let connector = self
            .connectors
            .get(source_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CacheError::UnknownSource(source_id.to_string()))?;

        let mut backoff = self.policy.transient_backoff();
        let mut attempt = 0u32;
        loop {
            self.admit(source_id)?;
            self.requests.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            match connector.fetch(operation, params).await {
                Ok(response) => {
                    debug!(
                        source = %source_id,
                        operation,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Cold fetch succeeded"
                    );
                    return Ok(response);
                }
                Err(FetchError::Transient(reason)) if attempt < self.policy.transient_retries => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        source = %source_id,
                        operation,
                        attempt,
                        error = %reason,
                        backoff_ms = backoff.as_millis(),
                        "Transient fetch failure, retrying"
                    );
                    // Up to 25% jitter
                    tokio::time::sleep(backoff.mul_f64(1.0 + rand::random::<f64>() * 0.25)).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %source_id, operation, error = %e, "Cold fetch failed");
                    return Err(e.into());
                }
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> ColdFetchStats {
        ColdFetchStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            transient_retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted results, then succeeds
    struct Scripted {
        script: Mutex<VecDeque<FetchError>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(script: Vec<FetchError>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        async fn fetch(&self, _operation: &str, _params: &Params) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(e) => Err(e),
                None => Ok(FetchResponse::new(json!({"ok": true}))),
            }
        }
    }

    fn policy(retries: u32) -> FetchConfig {
        FetchConfig {
            transient_retries: retries,
            transient_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let gate = ColdFetcher::new(policy(0), &HashMap::new()).unwrap_or_else(|e| panic!("{e}"));
        let result = gate.fetch("nowhere", "op", &Params::new()).await;
        assert!(matches!(result, Err(CacheError::UnknownSource(s)) if s == "nowhere"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let gate = ColdFetcher::new(policy(2), &HashMap::new()).unwrap_or_else(|e| panic!("{e}"));
        let connector = Scripted::new(vec![
            FetchError::Transient("timeout".into()),
            FetchError::Transient("503".into()),
        ]);
        gate.register("s", connector.clone());

        assert!(gate.fetch("s", "op", &Params::new()).await.is_ok());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gate.stats().transient_retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let gate = ColdFetcher::new(policy(5), &HashMap::new()).unwrap_or_else(|e| panic!("{e}"));
        let connector = Scripted::new(vec![FetchError::Permanent("no such symbol".into())]);
        gate.register("s", connector.clone());

        let result = gate.fetch("s", "op", &Params::new()).await;
        assert!(matches!(result, Err(CacheError::Fetch(FetchError::Permanent(_)))));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_fast_with_wait_time() {
        let mut limits = HashMap::new();
        limits.insert("s".to_string(), RateLimitConfig::new(1, 60.0));
        let gate = ColdFetcher::new(policy(0), &limits).unwrap_or_else(|e| panic!("{e}"));
        let connector = Scripted::new(Vec::new());
        gate.register("s", connector.clone());

        assert!(gate.fetch("s", "op", &Params::new()).await.is_ok());
        let err = gate
            .fetch("s", "op", &Params::new())
            .await
            .err()
            .unwrap_or_else(|| panic!("second call should be limited"));

        let retry_after = err.as_fetch().and_then(FetchError::retry_after);
        assert!(retry_after.is_some_and(|d| d > Duration::from_secs(50)), "{err:?}");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_request_budget_is_a_config_error() {
        let mut limits = HashMap::new();
        limits.insert("s".to_string(), RateLimitConfig::new(0, 1.0));
        assert!(matches!(ColdFetcher::new(policy(0), &limits), Err(CacheError::Config(_))));
    }
}
