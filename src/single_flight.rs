//! Request coalescing
//!
//! At most one execution per key is in flight. Callers arriving while it
//! runs await the same shared future and receive a clone of its output,
//! success or failure alike.
//!
//! Each execution runs on its own task, so it finishes (and leaves the map)
//! even when every caller waiting on it has been cancelled.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

/// The task running a flight panicked or was aborted by runtime shutdown
#[derive(Debug, Clone, thiserror::Error)]
#[error("in-flight task did not complete: {0}")]
pub struct FlightAborted(String);

/// RAII cleanup guard owned by the flight's task
///
/// Removes the map entry when the task ends, including by panic or abort.
/// Only the entry registered under this guard's id is removed.
struct CleanupGuard<K: Eq + Hash, T: Clone> {
    map: Arc<DashMap<K, (u64, Flight<T>)>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T: Clone> Drop for CleanupGuard<K, T> {
    fn drop(&mut self) {
        self.map.remove_if(&self.key, |_, (current, _)| *current == self.id);
    }
}

/// Keyed single-flight executor
pub struct SingleFlight<K, T> {
    in_flight: Arc<DashMap<K, (u64, Flight<T>)>>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` on a new task unless a flight for `key` is already
    /// running, in which case join it. Returns the output and whether this
    /// caller started the flight.
    ///
    /// Must be called within a tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (Result<T, FlightAborted>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // The shard lock is released at the end of this match, before awaiting
        let (flight, leader) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().1.clone(), false),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = CleanupGuard {
                    map: Arc::clone(&self.in_flight),
                    key,
                    id,
                };
                let work = make();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    work.await
                });
                let flight = async move { task.await.map_err(|e| FlightAborted(e.to_string())) }
                    .boxed()
                    .shared();
                vacant.insert((id, flight.clone()));
                (flight, true)
            }
        };

        (flight.await, leader)
    }

    /// Number of keys with a flight in progress
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<&'static str, Result<u32, String>>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flights = Arc::clone(&flights);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u32, _>("upstream down".to_string())
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (result, leader) = handle.await.unwrap_or_else(|e| panic!("join: {e}"));
            let result = result.unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(result, Err("upstream down".to_string()));
            leaders += usize::from(leader);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_completed_flight_is_not_reused() {
        let flights: SingleFlight<u8, u32> = SingleFlight::new();
        let (first, _) = flights.run(1, || async { 1 }).await;
        let (second, leader) = flights.run(1, || async { 2 }).await;
        assert_eq!(
            (first.unwrap_or_else(|e| panic!("{e}")), second.unwrap_or_else(|e| panic!("{e}"))),
            (1, 2)
        );
        assert!(leader);
    }

    #[tokio::test]
    async fn test_flight_completes_after_every_caller_is_cancelled() {
        let flights: Arc<SingleFlight<u8, u32>> = Arc::new(SingleFlight::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let caller = {
            let flights = Arc::clone(&flights);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                flights
                    .run(7, || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert_eq!(flights.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_late_caller_joins_running_flight() {
        let flights: Arc<SingleFlight<u8, u32>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let first = {
            let flights = Arc::clone(&flights);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                flights
                    .run(7, || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let (value, started) = flights.run(7, || async { 0 }).await;
        assert_eq!(value.unwrap_or_else(|e| panic!("{e}")), 42);
        assert!(!started);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_flight_is_reported_and_removed() {
        let flights: SingleFlight<u8, u32> = SingleFlight::new();
        let (result, _) = flights
            .run(3, || async {
                if u32::MAX > 0 {
                    panic!("connector bug");
                }
                0
            })
            .await;
        assert!(result.is_err());
        assert_eq!(flights.in_flight(), 0);
    }
}
