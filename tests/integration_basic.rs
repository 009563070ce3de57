//! Integration tests for the read path
//!
//! Tests Hot → Warm → Cold routing, TTL handling and compression

mod common;

use common::*;
use market_data_cache::{CacheError, Params, PutOptions, ReadOptions};
use serde::Deserialize;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(86_400);

/// Test a miss fetches once and the next read is a hot hit
#[tokio::test]
async fn test_miss_then_hot_hit() {
    let t = setup().await;
    let params = test_data::market("austin-tx");

    let first = t
        .cache
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let second = t
        .cache
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(first, second);
    assert_eq!(t.connector.calls(), 1);

    let stats = t.cache.stats().await;
    assert_eq!(stats.reads.reads, 2);
    assert_eq!(stats.reads.hits, 1);
    assert_eq!(stats.reads.misses, 1);
    assert_eq!(stats.hot.entries, 1);
    assert_eq!(stats.warm.map(|w| w.entries), Some(1));
}

/// Test parameter order does not change the cache key
#[tokio::test]
async fn test_parameter_order_is_irrelevant() {
    let t = setup().await;
    let a = Params::new().with("market", "denver-co").with("year", 2023);
    let b = Params::new().with("year", 2023).with("market", "denver-co");

    t.cache
        .get_or_fetch(SOURCE, "income", &a)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    t.cache
        .get_or_fetch(SOURCE, "income", &b)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(t.connector.calls(), 1);
}

/// Test entries survive a restart and are served from the warm tier
#[tokio::test]
async fn test_warm_tier_survives_restart() {
    let t = setup().await;
    let params = test_data::market("boise-id");
    let original = t
        .cache
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let restarted = t.reopen().await;
    let value = restarted
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(value, original);
    assert_eq!(t.connector.calls(), 1);

    let stats = restarted.stats().await;
    let warm = stats
        .reads
        .per_source
        .iter()
        .find(|s| s.source_id == SOURCE && s.tier == market_data_cache::Tier::Warm)
        .unwrap_or_else(|| panic!("no warm stats for {SOURCE}"));
    assert_eq!(warm.hits, 1);

    // Promoted: the next read is a hot hit
    restarted
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(restarted.stats().await.hot.hits, 1);
}

/// Test expired entries are refetched, live ones are not
#[tokio::test]
async fn test_ttl_expiry_triggers_refetch() {
    let t = setup().await;
    let params = test_data::market("tulsa-ok");

    t.cache
        .get_or_fetch(SOURCE, "rents", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    t.clock.advance(6 * DAY);
    t.cache
        .get_or_fetch(SOURCE, "rents", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(t.connector.calls(), 1, "entry is still within the 7 day default");

    t.clock.advance(DAY);
    let refreshed = t
        .cache
        .get_or_fetch(SOURCE, "rents", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(t.connector.calls(), 2);
    assert_eq!(refreshed["call"], 2);
}

/// Test per-source TTL and explicit overrides
#[tokio::test]
async fn test_ttl_overrides() {
    let mut config = test_config();
    config.ttl.sources.insert(SOURCE.to_string(), 1.0);
    let t = setup_with(config).await;
    let short = test_data::market("reno-nv");
    let long = test_data::market("fargo-nd");

    t.cache
        .get_or_fetch(SOURCE, "jobs", &short)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    t.cache
        .get_or_fetch_with(SOURCE, "jobs", &long, ReadOptions::with_ttl(3 * DAY))
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    t.clock.advance(2 * DAY);
    for params in [&short, &long] {
        t.cache
            .get_or_fetch(SOURCE, "jobs", params)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
    }

    // Only the source-default entry expired
    assert_eq!(t.connector.calls(), 3);
}

/// Test a zero TTL source is fetched every time and never stored
#[tokio::test]
async fn test_zero_ttl_is_never_cached() {
    let mut config = test_config();
    config.ttl.sources.insert(SOURCE.to_string(), 0.0);
    let t = setup_with(config).await;
    let params = test_data::market("miami-fl");

    for _ in 0..3 {
        t.cache
            .get_or_fetch(SOURCE, "quotes", &params)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
    }

    assert_eq!(t.connector.calls(), 3);
    assert_eq!(t.cache.stats().await.warm.map(|w| w.entries), Some(0));
}

/// Test large payloads are stored compressed and read back intact
#[tokio::test]
async fn test_large_payload_is_compressed() {
    let t = setup().await;
    t.connector.set_padding(64 * 1024);
    let params = test_data::market("houston-tx");

    let original = t
        .cache
        .get_or_fetch(SOURCE, "parcels", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let report = t
        .cache
        .inspect(SOURCE, 10)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let entry = report
        .entries
        .first()
        .unwrap_or_else(|| panic!("entry missing"));
    assert!(entry.compressed);
    assert!(entry.stored_bytes < entry.size_bytes, "{} >= {}", entry.stored_bytes, entry.size_bytes);

    let restarted = t.reopen().await;
    let value = restarted
        .get_or_fetch(SOURCE, "parcels", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(value, original);
    assert_eq!(t.connector.calls(), 1);
}

/// Test small payloads are stored as-is
#[tokio::test]
async fn test_small_payload_is_not_compressed() {
    let t = setup().await;
    t.cache
        .get_or_fetch(SOURCE, "population", &test_data::market("waco-tx"))
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let report = t
        .cache
        .inspect(SOURCE, 10)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(report.entries.iter().all(|e| !e.compressed));
}

#[derive(Debug, Deserialize)]
struct Echo {
    operation: String,
    call: u64,
}

/// Test typed reads deserialize the cached value
#[tokio::test]
async fn test_typed_read() {
    let t = setup().await;
    let echo: Echo = t
        .cache
        .get_or_fetch_typed(SOURCE, "population", &test_data::market("omaha-ne"))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(echo.operation, "population");
    assert_eq!(echo.call, 1);

    let wrong: Result<Vec<u8>, _> = t
        .cache
        .get_or_fetch_typed(SOURCE, "population", &test_data::market("omaha-ne"))
        .await;
    assert!(matches!(wrong, Err(CacheError::Serialization(_))));
}

/// Test peek never reaches the connector
#[tokio::test]
async fn test_peek_is_cache_only() {
    let t = setup().await;
    let params = test_data::market("provo-ut");

    assert!(t.cache.peek(SOURCE, "population", &params).await.is_none());
    assert_eq!(t.connector.calls(), 0);

    t.cache
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(t.cache.peek(SOURCE, "population", &params).await.is_some());
    assert_eq!(t.connector.calls(), 1);
}

/// Test explicit puts are readable without a fetch
#[tokio::test]
async fn test_put_then_read() {
    let t = setup().await;
    let params = test_data::market("salem-or");
    let stored = t
        .cache
        .put(
            SOURCE,
            "population",
            &params,
            &serde_json::json!({"population": 177_723}),
            PutOptions::default(),
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(stored);

    let value = t
        .cache
        .get_or_fetch(SOURCE, "population", &params)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(value["population"], 177_723);
    assert_eq!(t.connector.calls(), 0);
}

/// Test sources without a connector are rejected
#[tokio::test]
async fn test_unknown_source() {
    let t = setup().await;
    let result = t
        .cache
        .get_or_fetch("nowhere", "population", &Params::new())
        .await;
    assert!(matches!(result, Err(CacheError::UnknownSource(s)) if s == "nowhere"));
}

/// Test the health check probes both tiers
#[tokio::test]
async fn test_health_check() {
    let t = setup().await;
    assert!(t.cache.health_check().await);
}
