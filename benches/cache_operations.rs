//! Benchmarks for basic cache operations
//!
//! This benchmark suite measures the performance of:
//! - Writes through the Warm + Hot path at different payload sizes
//! - Hot tier hits
//! - Warm tier hits (hot miss, promotion)
//! - Cold fetches on a miss

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use market_data_cache::{
    CacheConfig, CacheManager, Connector, FetchError, FetchResponse, Params, PutOptions, async_trait,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const SOURCE: &str = "bench";

/// Answers immediately, or after a fixed delay
struct EchoConnector {
    delay: Duration,
}

#[async_trait]
impl Connector for EchoConnector {
    async fn fetch(&self, operation: &str, params: &Params) -> Result<FetchResponse, FetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(FetchResponse::new(json!({"operation": operation, "params": params})))
    }
}

/// Setup a cache over a temporary database for benchmarks
fn setup_cache(delay: Duration) -> (CacheManager, TempDir, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("Failed to create temp dir"));
    let cache = rt.block_on(async {
        CacheManager::builder()
            .with_warm_path(dir.path().join("bench.db"))
            .with_connector(SOURCE, Arc::new(EchoConnector { delay }))
            .build()
            .await
            .unwrap_or_else(|_| panic!("Failed to create cache"))
    });
    (cache, dir, rt)
}

/// Generate test data of specified size
fn test_data(size_bytes: usize) -> serde_json::Value {
    json!({
        "data": "x".repeat(size_bytes),
        "size": size_bytes,
        "as_of": "2025-01-01T00:00:00Z"
    })
}

fn market(i: u32) -> Params {
    Params::new().with("market", i)
}

/// Benchmark Warm + Hot write operations
fn bench_cache_put(c: &mut Criterion) {
    let (cache, _dir, rt) = setup_cache(Duration::ZERO);

    let mut group = c.benchmark_group("cache_put");
    group.measurement_time(Duration::from_secs(10));

    // 102_400 crosses the compression threshold
    for size in &[100, 1024, 10240, 102_400] {
        let data = test_data(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let params = market(rand::random::<u32>());
                    cache
                        .put(SOURCE, "put", &params, black_box(&data), PutOptions::default())
                        .await
                        .unwrap_or_else(|_| panic!("Failed to put"));
                });
            });
        });
    }

    group.finish();
}

/// Benchmark Hot tier hit performance
fn bench_hot_hit(c: &mut Criterion) {
    let (cache, _dir, rt) = setup_cache(Duration::ZERO);

    rt.block_on(async {
        for i in 0..100 {
            cache
                .put(SOURCE, "hot", &market(i), &test_data(1024), PutOptions::default())
                .await
                .unwrap_or_else(|_| panic!("Failed to put"));
        }
    });

    c.bench_function("hot_tier_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let params = market(u32::from(rand::random::<u8>() % 100));
                black_box(
                    cache
                        .get_or_fetch(SOURCE, "hot", &params)
                        .await
                        .unwrap_or_else(|_| panic!("Failed to get")),
                );
            });
        });
    });
}

/// Benchmark Warm tier hit performance (hot miss)
fn bench_warm_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("Failed to create temp dir"));
    // A one-byte hot budget admits nothing, so every read goes to the warm tier
    let mut config = CacheConfig::default();
    config.hot.max_bytes = 1;
    let cache = rt.block_on(async {
        CacheManager::builder()
            .with_config(config)
            .with_warm_path(dir.path().join("bench.db"))
            .build()
            .await
            .unwrap_or_else(|_| panic!("Failed to create cache"))
    });

    rt.block_on(async {
        for i in 0..100 {
            cache
                .put(SOURCE, "warm", &market(i), &test_data(1024), PutOptions::default())
                .await
                .unwrap_or_else(|_| panic!("Failed to put"));
        }
    });

    c.bench_function("warm_tier_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let params = market(u32::from(rand::random::<u8>() % 100));
                black_box(cache.peek(SOURCE, "warm", &params).await);
            });
        });
    });
}

/// Benchmark cold fetch on miss with different upstream latencies
fn bench_cold_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_fetch");

    for delay_ms in &[0u64, 1, 10] {
        let (cache, _dir, rt) = setup_cache(Duration::from_millis(*delay_ms));

        group.bench_with_input(BenchmarkId::from_parameter(delay_ms), delay_ms, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let params = market(rand::random::<u32>());
                    black_box(
                        cache
                            .get_or_fetch(SOURCE, "cold", &params)
                            .await
                            .unwrap_or_else(|_| panic!("Failed to fetch")),
                    );
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_put,
    bench_hot_hit,
    bench_warm_hit,
    bench_cold_fetch
);
criterion_main!(benches);
