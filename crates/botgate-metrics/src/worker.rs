use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// We record latencies in microseconds.
const LATENCY_SIGFIG: u8 = 3;
// Bot API requests are bounded by long-polling timeouts well below this. Values above are
// clamped.
const MAX_LATENCY_US: u64 = 10 * 60 * 1_000_000;

/// A worker counts as active if it saw any request or update within this window.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Half-life of the activity score.
const SCORE_HALF_LIFE: Duration = Duration::from_secs(60);

/// Statistics accumulator owned by one worker (or, with no parent, by the router itself).
///
/// Every event recorded here is also forwarded to the parent accumulator, if any.
#[derive(Debug)]
pub struct WorkerStats {
    parent: Option<Arc<WorkerStats>>,
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    created_at: Instant,
    last_activity: Option<Instant>,
    request_count: u64,
    update_count: u64,
    response_ok_count: u64,
    response_error_count: u64,
    active_request_count: u64,
    active_file_upload_count: u64,
    active_file_upload_bytes: u64,
    score: DecayingScore,
    methods: HashMap<String, Histogram<u64>>,
}

#[derive(Debug, Clone, Copy)]
struct DecayingScore {
    value: f64,
    updated_at: Instant,
}

impl DecayingScore {
    fn at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated_at);
        let half_lives = elapsed.as_secs_f64() / SCORE_HALF_LIFE.as_secs_f64();
        self.value * 0.5f64.powf(half_lives)
    }

    fn bump(&mut self, now: Instant, amount: f64) {
        self.value = self.at(now) + amount;
        self.updated_at = now;
    }
}

fn new_latency_histogram() -> Histogram<u64> {
    static HISTOGRAM_BOUNDS_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

    Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, LATENCY_SIGFIG).unwrap_or_else(|err| {
        if HISTOGRAM_BOUNDS_ERROR_LOGGED.set(()).is_ok() {
            tracing::debug!(
                target: "botgate.metrics",
                error = %err,
                "failed to construct bounded latency histogram; falling back to unbounded histogram"
            );
        }
        // hdrhistogram only errors for invalid bounds/precision.
        Histogram::<u64>::new(LATENCY_SIGFIG).expect("histogram")
    })
}

impl WorkerStats {
    /// Creates a root accumulator.
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Creates an accumulator whose events are also recorded into `parent`.
    pub fn with_parent(parent: Arc<WorkerStats>) -> Arc<Self> {
        Self::build(Some(parent))
    }

    fn build(parent: Option<Arc<WorkerStats>>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            parent,
            inner: Mutex::new(StatsInner {
                created_at: now,
                last_activity: None,
                request_count: 0,
                update_count: 0,
                response_ok_count: 0,
                response_error_count: 0,
                active_request_count: 0,
                active_file_upload_count: 0,
                active_file_upload_bytes: 0,
                score: DecayingScore {
                    value: 0.0,
                    updated_at: now,
                },
                methods: HashMap::new(),
            }),
        })
    }

    fn for_each_level(&self, mut f: impl FnMut(&mut StatsInner)) {
        let mut level = Some(self);
        while let Some(stats) = level {
            f(&mut stats.inner.lock());
            level = stats.parent.as_deref();
        }
    }

    /// Marks the start of a request. The returned guard must be finished (or dropped) when the
    /// request completes; dropping it unfinished counts as an error response.
    pub fn start_request(
        self: &Arc<Self>,
        method: &str,
        file_count: u64,
        file_bytes: u64,
    ) -> ActiveRequest {
        let now = Instant::now();
        self.for_each_level(|inner| {
            inner.request_count = inner.request_count.saturating_add(1);
            inner.active_request_count = inner.active_request_count.saturating_add(1);
            inner.active_file_upload_count =
                inner.active_file_upload_count.saturating_add(file_count);
            inner.active_file_upload_bytes =
                inner.active_file_upload_bytes.saturating_add(file_bytes);
            inner.last_activity = Some(now);
            inner.score.bump(now, 1.0);
        });
        ActiveRequest {
            stats: Arc::clone(self),
            method: method.to_owned(),
            file_count,
            file_bytes,
            started_at: now,
            finished: false,
        }
    }

    /// Records `count` updates delivered to the tenant.
    pub fn record_updates(&self, count: u64) {
        if count == 0 {
            return;
        }
        let now = Instant::now();
        self.for_each_level(|inner| {
            inner.update_count = inner.update_count.saturating_add(count);
            inner.last_activity = Some(now);
            inner.score.bump(now, count as f64);
        });
    }

    fn finish_request(&self, request: &ActiveRequest, ok: bool) {
        static HISTOGRAM_RECORD_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

        let elapsed = Instant::now().saturating_duration_since(request.started_at);
        let micros = elapsed.as_micros().min(u128::from(MAX_LATENCY_US)) as u64;
        let micros = micros.max(1);

        self.for_each_level(|inner| {
            inner.active_request_count = inner.active_request_count.saturating_sub(1);
            inner.active_file_upload_count = inner
                .active_file_upload_count
                .saturating_sub(request.file_count);
            inner.active_file_upload_bytes = inner
                .active_file_upload_bytes
                .saturating_sub(request.file_bytes);
            if ok {
                inner.response_ok_count = inner.response_ok_count.saturating_add(1);
            } else {
                inner.response_error_count = inner.response_error_count.saturating_add(1);
            }
            let histogram = inner
                .methods
                .entry(request.method.clone())
                .or_insert_with(new_latency_histogram);
            if let Err(err) = histogram.record(micros) {
                if HISTOGRAM_RECORD_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target: "botgate.metrics",
                        method = %request.method,
                        micros,
                        error = %err,
                        "failed to record latency sample"
                    );
                }
            }
        });
    }

    /// Whether the worker handled any traffic within [`ACTIVITY_WINDOW`].
    pub fn is_active(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        inner
            .last_activity
            .is_some_and(|at| now.saturating_duration_since(at) < ACTIVITY_WINDOW)
    }

    /// Recency-weighted activity: decayed event rate plus in-flight work.
    pub fn score(&self, now: Instant) -> f64 {
        let inner = self.inner.lock();
        inner.score.at(now)
            + inner.active_request_count as f64
            + inner.active_file_upload_count as f64
    }

    pub fn active_request_count(&self) -> u64 {
        self.inner.lock().active_request_count
    }

    pub fn snapshot(&self, now: Instant) -> WorkerStatsSnapshot {
        let inner = self.inner.lock();
        let methods = inner
            .methods
            .iter()
            .map(|(method, histogram)| {
                (
                    method.clone(),
                    MethodStatsSnapshot {
                        response_count: histogram.len(),
                        latency_us: latency_summary(histogram),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        WorkerStatsSnapshot {
            uptime_secs: now.saturating_duration_since(inner.created_at).as_secs_f64(),
            idle_secs: inner
                .last_activity
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            request_count: inner.request_count,
            update_count: inner.update_count,
            response_ok_count: inner.response_ok_count,
            response_error_count: inner.response_error_count,
            active_request_count: inner.active_request_count,
            active_file_upload_count: inner.active_file_upload_count,
            active_file_upload_bytes: inner.active_file_upload_bytes,
            score: inner.score.at(now),
            methods,
        }
    }
}

/// An in-flight request tracked by a [`WorkerStats`] accumulator.
#[derive(Debug)]
pub struct ActiveRequest {
    stats: Arc<WorkerStats>,
    method: String,
    file_count: u64,
    file_bytes: u64,
    started_at: Instant,
    finished: bool,
}

impl ActiveRequest {
    pub fn finish(mut self, ok: bool) {
        self.finished = true;
        self.stats.finish_request(&self, ok);
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.stats.finish_request(self, false);
        }
    }
}

fn latency_summary(hist: &Histogram<u64>) -> LatencySummary {
    if hist.is_empty() {
        return LatencySummary {
            p50_us: 0,
            p95_us: 0,
            max_us: 0,
        };
    }

    LatencySummary {
        p50_us: hist.value_at_quantile(0.50),
        p95_us: hist.value_at_quantile(0.95),
        max_us: hist.max(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    pub uptime_secs: f64,
    pub idle_secs: Option<f64>,
    pub request_count: u64,
    pub update_count: u64,
    pub response_ok_count: u64,
    pub response_error_count: u64,
    pub active_request_count: u64,
    pub active_file_upload_count: u64,
    pub active_file_upload_bytes: u64,
    pub score: f64,
    pub methods: BTreeMap<String, MethodStatsSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodStatsSnapshot {
    pub response_count: u64,
    pub latency_us: LatencySummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub p50_us: u64,
    pub p95_us: u64,
    pub max_us: u64,
}
