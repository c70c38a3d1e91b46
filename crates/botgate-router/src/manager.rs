//! The tenant router.
//!
//! [`Manager`] is a single task reading one mailbox: inbound queries, worker notices, statistics
//! requests, close requests. It exclusively owns the worker table, the token index and the
//! flood-control table, so messages are processed one at a time and no locking is needed to keep
//! "one worker per token".

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use botgate_metrics::{memory_usage, ServerCounters, WorkerStats};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::flood::{normalize_peer_address, FloodControlTable, FloodLimit, DEFAULT_FLOOD_LIMITS};
use crate::query::{
    is_webhook_method, Query, QueryError, QueryReply, QueryRequest, CLOSE_METHOD,
    SET_WEBHOOK_METHOD,
};
use crate::stats::{self, ServerAggregates, ServerStats, StatsSnapshot};
use crate::store::{CloseCompletion, UpdateLog, WebhookStore};
use crate::table::{WorkerId, WorkerTable};
use crate::token::{self, mask_token, ShardKey, TokenRange};
use crate::watchdog::{StallAction, Watchdog};
use crate::webhook::WebhookRegistration;
use crate::worker::{WorkerContext, WorkerEvents, WorkerFactory, WorkerHandle};

const TARGET: &str = "botgate.router";

/// Default watchdog window; maintenance runs ten times per window.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub timeout: Duration,
    pub on_stall: StallAction,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: WATCHDOG_TIMEOUT,
            on_stall: StallAction::Abort,
        }
    }
}

/// When the update log is garbage collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSchedule {
    /// Delay between startup and the first pass.
    pub initial_delay: Duration,
    /// Next delay after a pass that stopped early.
    pub retry_delay: Duration,
    /// Next delay after a pass that finished.
    pub idle_delay: Duration,
    /// Deleted-entry total growth that triggers a log line.
    pub report_threshold: u64,
}

impl Default for GcSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(600),
            retry_delay: Duration::from_secs(1),
            idle_delay: Duration::from_secs(60),
            report_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub token_range: TokenRange,
    pub flood_limits: Vec<FloodLimit>,
    /// `None` disables the watchdog.
    pub watchdog: Option<WatchdogConfig>,
    pub maintenance_interval: Duration,
    pub flood_sweep_interval: Duration,
    pub gc: GcSchedule,
    pub stats_top_count: usize,
    pub dump_top_count: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            token_range: TokenRange::ALL,
            flood_limits: DEFAULT_FLOOD_LIMITS.to_vec(),
            watchdog: Some(WatchdogConfig::default()),
            maintenance_interval: WATCHDOG_TIMEOUT / 10,
            flood_sweep_interval: Duration::from_secs(60),
            gc: GcSchedule::default(),
            stats_top_count: 50,
            dump_top_count: 10,
        }
    }
}

/// Collaborators the router is built from.
#[derive(Clone)]
pub struct ManagerServices {
    pub factory: Arc<dyn WorkerFactory>,
    pub update_log: Arc<dyn UpdateLog>,
    pub webhook_store: Arc<dyn WebhookStore>,
    pub counters: Arc<ServerCounters>,
}

#[derive(Debug)]
pub(crate) enum ManagerMessage {
    Route(Query),
    WorkerActive {
        id: WorkerId,
        active: bool,
    },
    WorkerStopped {
        id: WorkerId,
    },
    Stats {
        key_filter: String,
        reply: oneshot::Sender<StatsSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Waiting for live workers to stop.
    Closing,
    /// Waiting for the stores to close.
    ClosingStores,
    Stopped,
}

/// Client side of a running [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerMessage>,
}

impl ManagerHandle {
    /// Routes a query. If the router has already stopped the query is dropped, which answers it
    /// with a retry-later error.
    pub fn send(&self, query: Query) {
        let _ = self.tx.send(ManagerMessage::Route(query));
    }

    /// Builds a query from `request`, routes it and returns the reply channel.
    pub fn route(&self, request: QueryRequest) -> QueryReply {
        let (query, reply) = Query::new(request);
        self.send(query);
        reply
    }

    /// Shuts the router down and waits until every worker has stopped and the stores are closed.
    /// Concurrent calls all wait for the same shutdown; calls after it finished return at once.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(ManagerMessage::Close { reply }).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Statistics for workers whose lookup key starts with `key_filter`. An empty filter also
    /// computes process-wide aggregates.
    pub async fn stats(&self, key_filter: impl Into<String>) -> StatsSnapshot {
        let (reply, snapshot) = oneshot::channel();
        let message = ManagerMessage::Stats {
            key_filter: key_filter.into(),
            reply,
        };
        if self.tx.send(message).is_err() {
            return StatsSnapshot::Closing;
        }
        snapshot.await.unwrap_or(StatsSnapshot::Closing)
    }

    /// Whether the router task has exited.
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counting completion: fires `done` once `complete` has been called `count` times.
struct FanIn {
    remaining: AtomicUsize,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl FanIn {
    fn new(count: usize, done: oneshot::Sender<()>) -> Arc<Self> {
        let fan_in = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            done: Mutex::new(Some(done)),
        });
        if count == 0 {
            fan_in.fire();
        }
        fan_in
    }

    fn complete(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
    }
}

fn close_store(name: &'static str, close: impl FnOnce(CloseCompletion), barrier: Arc<FanIn>) {
    let (completion, closed) = oneshot::channel();
    close(completion);
    tokio::spawn(async move {
        match closed.await {
            Ok(Ok(())) => tracing::debug!(target: TARGET, store = name, "store closed"),
            Ok(Err(err)) => {
                tracing::warn!(target: TARGET, store = name, error = %err, "store failed to close cleanly")
            }
            Err(_) => {
                tracing::warn!(target: TARGET, store = name, "store dropped its close completion")
            }
        }
        barrier.complete();
    });
}

struct GcState {
    next_at: Instant,
    deleted_total: u64,
    last_reported: u64,
}

pub struct Manager {
    config: ManagerConfig,
    services: ManagerServices,
    mailbox: mpsc::WeakUnboundedSender<ManagerMessage>,
    workers: WorkerTable<WorkerHandle>,
    token_to_id: HashMap<String, WorkerId>,
    next_worker_seq: u64,
    flood: FloodControlTable,
    active_shards: HashMap<ShardKey, usize>,
    server_stats: Arc<WorkerStats>,
    watchdog: Option<Watchdog>,
    phase: Phase,
    close_waiters: Vec<oneshot::Sender<()>>,
    stores_closing: Option<oneshot::Receiver<()>>,
    started_at: Instant,
    start_unix_time: i64,
    next_maintenance: Instant,
    next_flood_sweep: Instant,
    gc: GcState,
}

impl Manager {
    /// Starts the router task on the current tokio runtime.
    ///
    /// Persisted webhooks are re-registered before any query sent through the returned handle is
    /// routed. Fails only if the watchdog thread cannot be spawned.
    pub fn start(config: ManagerConfig, services: ManagerServices) -> std::io::Result<ManagerHandle> {
        let watchdog = config
            .watchdog
            .as_ref()
            .map(|watchdog| Watchdog::spawn("router", watchdog.timeout, watchdog.on_stall.clone()))
            .transpose()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let start_unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_secs() as i64);

        let manager = Manager {
            flood: FloodControlTable::new(config.flood_limits.clone()),
            next_maintenance: now + config.maintenance_interval,
            next_flood_sweep: now + config.flood_sweep_interval,
            gc: GcState {
                next_at: now + config.gc.initial_delay,
                deleted_total: 0,
                last_reported: 0,
            },
            config,
            services,
            mailbox: tx.downgrade(),
            workers: WorkerTable::new(),
            token_to_id: HashMap::new(),
            next_worker_seq: 0,
            active_shards: HashMap::new(),
            server_stats: WorkerStats::new(),
            watchdog,
            phase: Phase::Running,
            close_waiters: Vec::new(),
            stores_closing: None,
            started_at: now,
            start_unix_time,
        };

        manager.restore_webhooks(&tx);
        tracing::info!(target: TARGET, "router started");
        tokio::spawn(manager.run(rx));
        Ok(ManagerHandle { tx })
    }

    fn restore_webhooks(&self, tx: &mpsc::UnboundedSender<ManagerMessage>) {
        let store = &self.services.webhook_store;
        for (key, value) in store.get_all() {
            let parsed = token::parse_webhook_key(&key)
                .filter(|parsed| self.config.token_range.contains(parsed.tenant_id));
            let Some(parsed) = parsed else {
                tracing::warn!(target: TARGET, key = %mask_token(&key), "dropping webhook");
                if let Err(err) = store.erase(&key) {
                    tracing::warn!(target: TARGET, error = %err, "failed to erase webhook");
                }
                continue;
            };
            let Some(registration) = WebhookRegistration::parse(&value) else {
                tracing::warn!(
                    target: TARGET,
                    token = %mask_token(parsed.token),
                    "ignoring unusable webhook registration"
                );
                continue;
            };

            tracing::warn!(
                target: TARGET,
                token = %mask_token(parsed.token),
                test_dc = parsed.is_test_dc,
                url = %registration.url,
                "restoring webhook"
            );
            let query = Query::internal(QueryRequest {
                token: parsed.token.to_owned(),
                method: SET_WEBHOOK_METHOD.to_owned(),
                args: registration.restore_args(),
                is_test_dc: parsed.is_test_dc,
                ..QueryRequest::default()
            });
            let _ = tx.send(ManagerMessage::Route(query));
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerMessage>) {
        let mut stores_closed: Option<oneshot::Receiver<()>> = None;
        loop {
            if let Some(closing) = self.stores_closing.take() {
                stores_closed = Some(closing);
            }
            let tick_at = self.next_maintenance;
            let ticking = self.phase == Phase::Running;
            let waiting_for_stores = stores_closed.is_some();

            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                () = tokio::time::sleep_until(tick_at), if ticking => {
                    self.maintenance(Instant::now());
                }
                _ = wait_closed(&mut stores_closed), if waiting_for_stores => self.finish_close(),
            }

            if self.phase == Phase::Stopped {
                break;
            }
        }
        // Queries still queued are dropped here and answered with a retry-later error.
    }

    fn handle(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::Route(query) => self.route(query),
            ManagerMessage::WorkerActive { id, active } => self.set_worker_active(id, active),
            ManagerMessage::WorkerStopped { id } => self.on_worker_stopped(id),
            ManagerMessage::Stats { key_filter, reply } => {
                let _ = reply.send(self.stats(&key_filter));
            }
            ManagerMessage::Close { reply } => self.close(reply),
        }
    }

    fn route(&mut self, query: Query) {
        if self.phase != Phase::Running {
            query.fail(QueryError::ServiceUnavailable);
            return;
        }

        let tenant_id = match token::validate(query.token(), self.config.token_range) {
            Ok(tenant_id) => tenant_id,
            Err(err) => {
                tracing::debug!(
                    target: TARGET,
                    token = %mask_token(query.token()),
                    error = %err,
                    "rejecting query"
                );
                query.fail(err.into());
                return;
            }
        };

        let key = token::lookup_key(query.token(), query.is_test_dc());
        if let Some(handle) = self.token_to_id.get(&key).and_then(|id| self.workers.get(*id)) {
            handle.worker.send(query);
            return;
        }

        if query.method() == CLOSE_METHOD {
            query.fail(QueryError::BadRequest(
                "the bot has already been closed".to_owned(),
            ));
            return;
        }

        if !query.is_authorized() {
            if let Some(peer) = query.peer_address().and_then(normalize_peer_address) {
                if let Err(retry_after) = self.flood.admit(&peer, Instant::now()) {
                    tracing::info!(
                        target: TARGET,
                        peer = %peer,
                        retry_after,
                        "worker creation rate limited"
                    );
                    query.fail(QueryError::RateLimited { retry_after });
                    return;
                }
            }
        }

        let Some(mailbox) = self.mailbox.upgrade() else {
            query.fail(QueryError::ServiceUnavailable);
            return;
        };

        let token = query.token().to_owned();
        let is_test_dc = query.is_test_dc();
        let shard_key = ShardKey::new(tenant_id, is_test_dc);
        let stats = WorkerStats::with_parent(self.server_stats.clone());
        let seq = self.next_worker_seq;
        self.next_worker_seq += 1;
        let services = &self.services;
        let id = self.workers.insert_with(|id| {
            let worker = services.factory.spawn(WorkerContext {
                id,
                token: token.clone(),
                is_test_dc,
                tenant_id,
                shard_key,
                stats: stats.clone(),
                events: WorkerEvents::new(id, mailbox),
                update_log: services.update_log.clone(),
                webhook_store: services.webhook_store.clone(),
            });
            WorkerHandle {
                seq,
                key: key.clone(),
                token: token.clone(),
                is_test_dc,
                shard_key,
                stats,
                worker,
                active: false,
            }
        });
        tracing::info!(
            target: TARGET,
            worker = %id,
            tenant_id,
            test_dc = is_test_dc,
            "created worker"
        );

        let Some(handle) = self.workers.get(id) else {
            return;
        };
        if !is_webhook_method(query.method()) {
            let registration = self
                .services
                .webhook_store
                .get(&token::webhook_key(&token, is_test_dc))
                .and_then(|value| WebhookRegistration::parse(&value));
            if let Some(registration) = registration {
                tracing::debug!(target: TARGET, worker = %id, "restoring webhook for new worker");
                handle.worker.send(Query::internal(QueryRequest {
                    token: token.clone(),
                    method: SET_WEBHOOK_METHOD.to_owned(),
                    args: registration.restore_args(),
                    is_test_dc,
                    ..QueryRequest::default()
                }));
            }
        }
        handle.worker.send(query);
        self.token_to_id.insert(key, id);
    }

    fn set_worker_active(&mut self, id: WorkerId, active: bool) {
        let Some(handle) = self.workers.get_mut(id) else {
            return;
        };
        if handle.active == active {
            return;
        }
        handle.active = active;
        let shard_key = handle.shard_key;
        if active {
            *self.active_shards.entry(shard_key).or_default() += 1;
        } else {
            self.release_shard(shard_key);
        }
    }

    fn release_shard(&mut self, shard_key: ShardKey) {
        if let Some(count) = self.active_shards.get_mut(&shard_key) {
            *count -= 1;
            if *count == 0 {
                self.active_shards.remove(&shard_key);
            }
        }
    }

    fn on_worker_stopped(&mut self, id: WorkerId) {
        let Some(handle) = self.workers.remove(id) else {
            return;
        };
        if self.token_to_id.get(&handle.key) == Some(&id) {
            self.token_to_id.remove(&handle.key);
        }
        if handle.active {
            self.release_shard(handle.shard_key);
        }
        tracing::info!(
            target: TARGET,
            worker = %id,
            token = %mask_token(&handle.token),
            "worker stopped"
        );

        if self.phase == Phase::Closing && self.workers.is_empty() {
            self.close_stores();
        }
    }

    fn close(&mut self, reply: oneshot::Sender<()>) {
        match self.phase {
            Phase::Running => {}
            Phase::Closing | Phase::ClosingStores => {
                self.close_waiters.push(reply);
                return;
            }
            Phase::Stopped => {
                let _ = reply.send(());
                return;
            }
        }

        self.close_waiters.push(reply);
        self.phase = Phase::Closing;
        self.watchdog = None;
        tracing::warn!(target: TARGET, workers = self.workers.len(), "closing router");
        self.dump_statistics();

        for (_, handle) in self.workers.iter() {
            handle.worker.close();
        }
        if self.workers.is_empty() {
            self.close_stores();
        }
    }

    fn close_stores(&mut self) {
        self.phase = Phase::ClosingStores;
        tracing::warn!(target: TARGET, "closing stores");

        let (done, closed) = oneshot::channel();
        let barrier = FanIn::new(2, done);
        let update_log = self.services.update_log.clone();
        close_store(
            "update_log",
            move |completion| update_log.close(completion),
            barrier.clone(),
        );
        let webhook_store = self.services.webhook_store.clone();
        close_store(
            "webhook_store",
            move |completion| webhook_store.close(completion),
            barrier,
        );
        self.stores_closing = Some(closed);
    }

    fn finish_close(&mut self) {
        debug_assert!(self.active_shards.is_empty());
        self.phase = Phase::Stopped;
        tracing::warn!(target: TARGET, "router stopped");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn maintenance(&mut self, now: Instant) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.kick();
        }
        self.next_maintenance = now + self.config.maintenance_interval;

        if now >= self.gc.next_at {
            self.run_gc(now);
        }

        if now >= self.next_flood_sweep {
            let dropped = self.flood.sweep(now);
            if dropped > 0 {
                tracing::debug!(target: TARGET, dropped, "swept idle flood-control keys");
            }
            self.next_flood_sweep = now + self.config.flood_sweep_interval;
        }
    }

    /// Logical unix time: wall clock at startup advanced by the monotonic clock.
    fn unix_time(&self, now: Instant) -> i64 {
        self.start_unix_time + now.saturating_duration_since(self.started_at).as_secs() as i64
    }

    fn run_gc(&mut self, now: Instant) {
        let cutoff = self.unix_time(now);
        let outcome = self.services.update_log.run_gc(cutoff);
        let schedule = self.config.gc;
        self.gc.next_at = now
            + if outcome.finished {
                schedule.idle_delay
            } else {
                schedule.retry_delay
            };

        self.gc.deleted_total += outcome.deleted;
        if self.gc.deleted_total > self.gc.last_reported + schedule.report_threshold {
            tracing::warn!(
                target: TARGET,
                deleted_total = self.gc.deleted_total,
                "garbage collected expired updates"
            );
            self.gc.last_reported = self.gc.deleted_total;
        }
    }

    fn stats(&self, key_filter: &str) -> StatsSnapshot {
        if self.phase != Phase::Running {
            return StatsSnapshot::Closing;
        }
        StatsSnapshot::Ready(self.server_stats(key_filter, self.config.stats_top_count))
    }

    fn server_stats(&self, key_filter: &str, limit: usize) -> ServerStats {
        let now = Instant::now();
        let aggregates = key_filter.is_empty().then(|| ServerAggregates {
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs_f64(),
            worker_count: self.workers.len(),
            active_worker_count: stats::active_worker_count(&self.workers, now),
            active_shard_count: self.active_shards.len(),
            memory: memory_usage(),
            counters: self.services.counters.snapshot(),
            server: self.server_stats.snapshot(now),
        });
        ServerStats {
            aggregates,
            workers: stats::top_workers(&self.workers, now, key_filter, limit),
        }
    }

    fn dump_statistics(&self) {
        let snapshot = self.server_stats("", self.config.dump_top_count);
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::warn!(target: TARGET, stats = %json, "statistics at close"),
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "failed to serialize statistics")
            }
        }
    }
}

async fn wait_closed(closed: &mut Option<oneshot::Receiver<()>>) {
    match closed {
        Some(closed) => {
            let _ = closed.await;
        }
        None => std::future::pending().await,
    }
}
