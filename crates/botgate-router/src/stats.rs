//! Statistics snapshot handed to the presentation layer.

use botgate_metrics::{CounterSnapshot, MemoryUsage, WorkerStatsSnapshot};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::table::{WorkerId, WorkerTable};
use crate::token::mask_token;
use crate::webhook::WebhookSummary;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum StatsSnapshot {
    /// Shutdown has begun; no statistics are computed any more.
    Closing,
    Ready(ServerStats),
}

impl StatsSnapshot {
    pub fn is_closing(&self) -> bool {
        matches!(self, StatsSnapshot::Closing)
    }

    pub fn ready(&self) -> Option<&ServerStats> {
        match self {
            StatsSnapshot::Ready(stats) => Some(stats),
            StatsSnapshot::Closing => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Process-wide aggregates; only computed for unfiltered requests.
    pub aggregates: Option<ServerAggregates>,
    /// Most active workers first.
    pub workers: Vec<WorkerStatBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAggregates {
    pub uptime_secs: f64,
    pub worker_count: usize,
    pub active_worker_count: usize,
    /// Shard keys with at least one worker consuming its update log.
    pub active_shard_count: usize,
    pub memory: Option<MemoryUsage>,
    pub counters: CounterSnapshot,
    pub server: WorkerStatsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatBlock {
    pub worker_id: WorkerId,
    pub tenant_id: u64,
    pub uptime_secs: f64,
    pub masked_token: String,
    pub is_test_dc: bool,
    pub username: String,
    pub webhook: Option<WebhookSummary>,
    pub head_update_id: u64,
    pub tail_update_id: u64,
    pub pending_update_count: u64,
    pub stats: WorkerStatsSnapshot,
}

fn stat_block(id: WorkerId, handle: &WorkerHandle, now: Instant) -> WorkerStatBlock {
    let info = handle.worker.info();
    WorkerStatBlock {
        worker_id: id,
        tenant_id: info.tenant_id,
        uptime_secs: now.saturating_duration_since(info.started_at).as_secs_f64(),
        masked_token: mask_token(&handle.token),
        is_test_dc: handle.is_test_dc,
        username: info.username,
        webhook: info.webhook,
        head_update_id: info.head_update_id,
        tail_update_id: info.tail_update_id,
        pending_update_count: info.pending_update_count,
        stats: handle.stats.snapshot(now),
    }
}

/// Up to `limit` workers whose lookup key starts with `key_filter`, highest score first.
///
/// Equal scores keep creation order so repeated snapshots list workers identically.
pub(crate) fn top_workers(
    table: &WorkerTable<WorkerHandle>,
    now: Instant,
    key_filter: &str,
    limit: usize,
) -> Vec<WorkerStatBlock> {
    let mut ranked: Vec<(f64, u64, WorkerId)> = table
        .iter()
        .filter(|(_, handle)| handle.key.starts_with(key_filter))
        .map(|(id, handle)| (handle.stats.score(now), handle.seq, id))
        .collect();
    ranked.sort_by(|(a_score, a_seq, _), (b_score, b_seq, _)| {
        b_score.total_cmp(a_score).then_with(|| a_seq.cmp(b_seq))
    });
    ranked
        .into_iter()
        .take(limit)
        .filter_map(|(_, _, id)| table.get(id).map(|handle| stat_block(id, handle, now)))
        .collect()
}

pub(crate) fn active_worker_count(table: &WorkerTable<WorkerHandle>, now: Instant) -> usize {
    table
        .iter()
        .filter(|(_, handle)| handle.stats.is_active(now))
        .count()
}
