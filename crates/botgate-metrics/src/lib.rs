//! Runtime statistics for the botgate router.
//!
//! - [`WorkerStats`]: per-worker accumulator (counters, activity score, per-method latency
//!   histograms). Accumulators can be chained to a parent so a router-wide aggregate sees every
//!   event recorded by any worker.
//! - [`ServerCounters`]: process-wide gauges shared by reference between the transport layer,
//!   the workers and the router.
//! - [`memory_usage`]: best-effort process memory sampling.

mod counters;
mod process;
mod worker;

pub use counters::{CounterSnapshot, ServerCounters};
pub use process::{memory_usage, MemoryUsage};
pub use worker::{
    ActiveRequest, LatencySummary, MethodStatsSnapshot, WorkerStats, WorkerStatsSnapshot,
    ACTIVITY_WINDOW,
};
