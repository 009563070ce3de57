//! Prefetch scheduler
//!
//! Warms the cache ahead of demand. A submitted [`PrefetchJob`] runs as its
//! own task: targets beyond the neighbor radius are dropped, the rest are
//! ordered nearest-first, already-warm targets are skipped, and the others
//! are dispatched to at most `max_parallel` concurrent workers. Per-source
//! rate limits are enforced independently by the cold fetcher gate; a
//! rate-limited target sleeps for the advertised wait and retries a bounded
//! number of times before it is recorded as failed.
//!
//! Cancellation is cooperative. The dispatcher stops handing out targets
//! once it observes the token; workers finish the fetch they are in.

use crate::config::PrefetchConfig;
use crate::error::{CacheError, CacheResult, FetchError};
use crate::key::Params;
use crate::traits::{WarmOutcome, Warmer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Operation used for targets that do not name one
pub const DEFAULT_OPERATION: &str = "market";

/// One `(market, source)` pair to warm
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchTarget {
    pub market: String,
    pub source_id: String,
    pub operation: String,
    pub params: Params,
    /// Distance from the focus market; `None` is treated as in range and nearest
    pub distance: Option<f64>,
}

impl PrefetchTarget {
    /// Target for the source's default market request
    #[must_use]
    pub fn new(market: impl Into<String>, source_id: impl Into<String>) -> Self {
        let market = market.into();
        Self {
            params: Params::new().with("market", market.as_str()),
            market,
            source_id: source_id.into(),
            operation: DEFAULT_OPERATION.to_string(),
            distance: None,
        }
    }

    #[must_use]
    pub fn with_request(mut self, operation: impl Into<String>, params: Params) -> Self {
        self.operation = operation.into();
        self.params = params;
        self
    }

    #[must_use]
    pub const fn at_distance(mut self, distance: f64) -> Self {
        self.distance = Some(distance);
        self
    }
}

/// A batch of targets to warm
#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub targets: Vec<PrefetchTarget>,
    /// Worker pool size; 0 uses `prefetch.max_parallel`
    pub max_parallel: usize,
    pub created_at: DateTime<Utc>,
}

impl PrefetchJob {
    #[must_use]
    pub fn new(targets: Vec<PrefetchTarget>) -> Self {
        Self {
            targets,
            max_parallel: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }
}

/// Point-in-time job progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchProgress {
    /// Targets in the submitted job
    pub total: u64,
    /// Dropped for lying beyond the neighbor radius
    pub out_of_range: u64,
    /// Handed to a worker
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Already warm, no cold call made
    pub skipped: u64,
    /// Never dispatched because the job was cancelled
    pub not_dispatched: u64,
    pub finished: bool,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct ProgressCounters {
    total: AtomicU64,
    out_of_range: AtomicU64,
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    not_dispatched: AtomicU64,
    finished: AtomicBool,
}

impl ProgressCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, cancelled: bool) -> PrefetchProgress {
        PrefetchProgress {
            total: self.total.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            not_dispatched: self.not_dispatched.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Acquire),
            cancelled,
        }
    }
}

/// Observe or cancel a submitted job
#[derive(Debug)]
pub struct PrefetchHandle {
    id: Uuid,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PrefetchHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn progress(&self) -> PrefetchProgress {
        self.progress.snapshot(self.cancel.is_cancelled())
    }

    /// Stop dispatching further targets
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job, for callers that hand `wait` to another task
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to finish and return its final progress
    pub async fn wait(self) -> PrefetchProgress {
        if let Err(e) = self.task.await {
            error!(job = %self.id, error = %e, "Prefetch job task failed");
        }
        self.progress.snapshot(self.cancel.is_cancelled())
    }
}

/// Dispatches prefetch jobs against a [`Warmer`]
#[derive(Clone)]
pub struct PrefetchScheduler {
    warmer: Arc<dyn Warmer>,
    config: PrefetchConfig,
}

impl PrefetchScheduler {
    #[must_use]
    pub fn new(warmer: Arc<dyn Warmer>, config: PrefetchConfig) -> Self {
        Self { warmer, config }
    }

    /// Start a job without waiting for it
    ///
    /// # Errors
    ///
    /// `PrefetchDisabled` when `prefetch.enabled` is false.
    pub fn submit(&self, job: PrefetchJob) -> CacheResult<PrefetchHandle> {
        if !self.config.enabled {
            return Err(CacheError::PrefetchDisabled);
        }

        let id = Uuid::new_v4();
        let progress = Arc::new(ProgressCounters::default());
        progress.total.store(job.targets.len() as u64, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let parallel = if job.max_parallel > 0 {
            job.max_parallel
        } else {
            self.config.max_parallel
        };
        info!(job = %id, targets = job.targets.len(), max_parallel = parallel, "Prefetch job submitted");

        let run = JobRun {
            id,
            warmer: Arc::clone(&self.warmer),
            radius: self.config.neighbor_radius,
            max_rate_limit_retries: self.config.max_rate_limit_retries,
            parallel: parallel.max(1),
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(job.targets));

        Ok(PrefetchHandle {
            id,
            progress,
            cancel,
            task,
        })
    }
}

/// Targets within `radius`, nearest first; unknown distances sort first
fn plan(targets: Vec<PrefetchTarget>, radius: f64) -> (Vec<PrefetchTarget>, u64) {
    let before = targets.len();
    let mut kept: Vec<PrefetchTarget> = targets
        .into_iter()
        .filter(|t| t.distance.is_none_or(|d| d <= radius))
        .collect();
    let dropped = (before - kept.len()) as u64;
    kept.sort_by(|a, b| {
        a.distance
            .unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&b.distance.unwrap_or(f64::NEG_INFINITY))
    });
    (kept, dropped)
}

struct JobRun {
    id: Uuid,
    warmer: Arc<dyn Warmer>,
    radius: f64,
    max_rate_limit_retries: u32,
    parallel: usize,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
}

impl JobRun {
    async fn execute(self, targets: Vec<PrefetchTarget>) {
        let (targets, out_of_range) = plan(targets, self.radius);
        self.progress.out_of_range.store(out_of_range, Ordering::Relaxed);
        if out_of_range > 0 {
            debug!(job = %self.id, out_of_range, "Dropped targets beyond neighbor radius");
        }

        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut workers = JoinSet::new();
        let mut pending = targets.into_iter();

        for target in pending.by_ref() {
            if self.cancel.is_cancelled() {
                ProgressCounters::bump(&self.progress.not_dispatched);
                break;
            }
            if self
                .warmer
                .is_warm(&target.source_id, &target.operation, &target.params)
                .await
            {
                debug!(job = %self.id, market = %target.market, source = %target.source_id, "Already warm, skipped");
                ProgressCounters::bump(&self.progress.skipped);
                continue;
            }

            let permit = tokio::select! {
                () = self.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                ProgressCounters::bump(&self.progress.not_dispatched);
                break;
            };

            ProgressCounters::bump(&self.progress.attempted);
            let worker = Worker {
                job: self.id,
                warmer: Arc::clone(&self.warmer),
                max_rate_limit_retries: self.max_rate_limit_retries,
                progress: Arc::clone(&self.progress),
                cancel: self.cancel.clone(),
            };
            workers.spawn(async move {
                let _permit = permit;
                worker.warm(target).await;
            });
        }

        let undispatched = pending.count() as u64;
        self.progress.not_dispatched.fetch_add(undispatched, Ordering::Relaxed);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(job = %self.id, error = %e, "Prefetch worker panicked");
                ProgressCounters::bump(&self.progress.failed);
            }
        }

        self.progress.finished.store(true, Ordering::Release);
        let p = self.progress.snapshot(self.cancel.is_cancelled());
        info!(
            job = %self.id,
            succeeded = p.succeeded,
            failed = p.failed,
            skipped = p.skipped,
            not_dispatched = p.not_dispatched,
            cancelled = p.cancelled,
            "Prefetch job finished"
        );
    }
}

struct Worker {
    job: Uuid,
    warmer: Arc<dyn Warmer>,
    max_rate_limit_retries: u32,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
}

impl Worker {
    async fn warm(&self, target: PrefetchTarget) {
        let mut rate_limited = 0u32;
        loop {
            let result = self
                .warmer
                .warm(&target.source_id, &target.operation, &target.params)
                .await;
            match result {
                Ok(WarmOutcome::Fetched) => {
                    ProgressCounters::bump(&self.progress.succeeded);
                    return;
                }
                Ok(WarmOutcome::AlreadyWarm) => {
                    ProgressCounters::bump(&self.progress.skipped);
                    return;
                }
                Err(CacheError::Fetch(FetchError::RateLimited { retry_after, .. }))
                    if rate_limited < self.max_rate_limit_retries =>
                {
                    rate_limited += 1;
                    debug!(
                        job = %self.job,
                        source = %target.source_id,
                        market = %target.market,
                        attempt = rate_limited,
                        ?retry_after,
                        "Rate limited, retrying target"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            ProgressCounters::bump(&self.progress.failed);
                            return;
                        }
                        () = tokio::time::sleep(retry_after) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        job = %self.job,
                        source = %target.source_id,
                        market = %target.market,
                        error = %e,
                        "Prefetch target failed"
                    );
                    ProgressCounters::bump(&self.progress.failed);
                    return;
                }
            }
        }
    }
}
