//! Metrics decorator
//!
//! Counts calls, errors and misses and tracks timing and payload-size
//! distributions for the wrapped store. Counters are atomics updated from
//! many tasks at once; min and max use compare-and-swap loops since a plain
//! add cannot express them. The report is logged once on close.

use crate::error::CacheprogResult;
use crate::storage::{CacheEntry, PutRequest, Storage, StorageKey};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reported for min, max and avg when there are no samples
pub const NO_SAMPLES: i64 = -1;

/// Lock-free min/max/sum over u64 samples
#[derive(Debug)]
struct Distribution {
    samples: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Distribution {
    fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    fn record(&self, value: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        // fetch_update retries until no other writer moved the bound first.
        let _ = self
            .min
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (value < current).then_some(value)
            });
        let _ = self
            .max
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (value > current).then_some(value)
            });
    }

    fn summary(&self) -> DistributionSummary {
        let samples = self.samples.load(Ordering::Acquire);
        let sum = self.sum.load(Ordering::Acquire);
        if samples == 0 {
            return DistributionSummary {
                samples,
                sum,
                min: NO_SAMPLES,
                max: NO_SAMPLES,
                avg: NO_SAMPLES,
            };
        }
        DistributionSummary {
            samples,
            sum,
            min: clamp(self.min.load(Ordering::Acquire)),
            max: clamp(self.max.load(Ordering::Acquire)),
            avg: clamp(sum / samples),
        }
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Per-operation counters
#[derive(Debug)]
struct OperationStats {
    calls: AtomicU64,
    errors: AtomicU64,
    misses: AtomicU64,
    duration_us: Distribution,
    body_bytes: Distribution,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            duration_us: Distribution::new(),
            body_bytes: Distribution::new(),
        }
    }

    fn record_call<T>(&self, started: Instant, result: &CacheprogResult<T>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.duration_us.record(elapsed);
    }
}

/// Snapshot of a distribution; min/max/avg are [`NO_SAMPLES`] when empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistributionSummary {
    pub samples: u64,
    pub sum: u64,
    pub min: i64,
    pub max: i64,
    pub avg: i64,
}

/// Snapshot of one operation's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub calls: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub misses: Option<u64>,
    pub duration_us: DistributionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_bytes: Option<DistributionSummary>,
}

/// Snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub get: OperationReport,
    pub put: OperationReport,
}

/// Store decorator recording metrics for every call
pub struct MetricsStorage<S> {
    inner: S,
    get: OperationStats,
    put: OperationStats,
}

impl<S: Storage> MetricsStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            get: OperationStats::new(),
            put: OperationStats::new(),
        }
    }

    /// Current counters
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            get: OperationReport {
                calls: self.get.calls.load(Ordering::Acquire),
                errors: self.get.errors.load(Ordering::Acquire),
                misses: Some(self.get.misses.load(Ordering::Acquire)),
                duration_us: self.get.duration_us.summary(),
                body_bytes: None,
            },
            put: OperationReport {
                calls: self.put.calls.load(Ordering::Acquire),
                errors: self.put.errors.load(Ordering::Acquire),
                misses: None,
                duration_us: self.put.duration_us.summary(),
                body_bytes: Some(self.put.body_bytes.summary()),
            },
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for MetricsStorage<S> {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        let started = Instant::now();
        let result = self.inner.get(ctx, key).await;
        self.get.record_call(started, &result);
        if matches!(result, Ok(None)) {
            self.get.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        let body_size = request.body_size;
        let started = Instant::now();
        let result = self.inner.put(ctx, request).await;
        self.put.record_call(started, &result);
        self.put.body_bytes.record(body_size);
        result
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        let result = self.inner.close(ctx).await;

        let report = self.report();
        match serde_json::to_string(&report) {
            Ok(json) => info!(target: "cacheprog::metrics", report = %json, "cache metrics"),
            Err(e) => info!(target: "cacheprog::metrics", "cache metrics unavailable: {}", e),
        }

        result
    }
}
