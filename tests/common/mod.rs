//! Common utilities for integration tests
//!
//! - Temporary warm-tier databases
//! - A scripted connector that counts calls and peak concurrency
//! - A manual clock for simulating time passing

#![allow(dead_code)]

use market_data_cache::{
    CacheConfig, CacheManager, Connector, FetchError, FetchResponse, ManualClock, Params,
    async_trait,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const SOURCE: &str = "census";

/// Connector whose behavior tests can change between calls
#[derive(Default)]
pub struct ScriptedConnector {
    calls: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
    delay: Mutex<Duration>,
    version_tag: Mutex<Option<String>>,
    failure: Mutex<Option<FetchError>>,
    padding: Mutex<usize>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once
    pub fn peak_concurrency(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_version(&self, tag: Option<&str>) {
        *self.version_tag.lock() = tag.map(str::to_string);
    }

    /// Every following call fails with `error` until cleared
    pub fn fail_with(&self, error: Option<FetchError>) {
        *self.failure.lock() = error;
    }

    /// Add a filler field of `bytes` characters to every response
    pub fn set_padding(&self, bytes: usize) {
        *self.padding.lock() = bytes;
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn fetch(&self, operation: &str, params: &Params) -> Result<FetchResponse, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let padding = *self.padding.lock();
        let mut value = json!({
            "operation": operation,
            "params": params,
            "call": call,
        });
        if padding > 0 {
            value["filler"] = Value::String("x".repeat(padding));
        }
        let response = FetchResponse::new(value);
        Ok(match self.version_tag.lock().clone() {
            Some(tag) => response.with_version(tag),
            None => response,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// A cache over a temporary database, with a manual clock and one scripted source
pub struct TestCache {
    pub cache: CacheManager,
    pub connector: Arc<ScriptedConnector>,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

impl TestCache {
    pub fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("warm.db")
    }

    /// A second manager over the same database, as after a restart
    pub async fn reopen(&self) -> CacheManager {
        build(self.config(), &self.dir, &self.connector, &self.clock).await
    }

    pub fn config(&self) -> CacheConfig {
        self.cache.config().clone()
    }
}

async fn build(
    config: CacheConfig,
    dir: &TempDir,
    connector: &Arc<ScriptedConnector>,
    clock: &Arc<ManualClock>,
) -> CacheManager {
    CacheManager::builder()
        .with_config(config)
        .with_warm_path(dir.path().join("warm.db"))
        .with_connector(SOURCE, Arc::clone(connector) as Arc<dyn Connector>)
        .with_clock(Arc::clone(clock) as Arc<dyn market_data_cache::Clock>)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache: {e}"))
}

/// Test configuration: fast retries, no prefetch radius surprises
pub fn test_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.fetch.transient_backoff_ms = 1;
    config.warm.reader_connections = 2;
    config
}

pub async fn setup() -> TestCache {
    setup_with(test_config()).await
}

pub async fn setup_with(config: CacheConfig) -> TestCache {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("Failed to create temp dir: {e}"));
    let connector = ScriptedConnector::new();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = build(config, &dir, &connector, &clock).await;
    TestCache {
        cache,
        connector,
        clock,
        dir,
    }
}

/// Test data generators
pub mod test_data {
    use market_data_cache::Params;

    pub fn market(name: &str) -> Params {
        Params::new().with("market", name).with("year", 2023)
    }
}
