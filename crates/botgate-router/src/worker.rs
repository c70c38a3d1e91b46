//! Interface between the router and per-tenant workers.

use std::sync::Arc;

use botgate_metrics::WorkerStats;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::manager::ManagerMessage;
use crate::query::Query;
use crate::store::{UpdateLog, WebhookStore};
use crate::table::WorkerId;
use crate::token::ShardKey;
use crate::webhook::WebhookSummary;

/// A running per-tenant worker, exclusively owned by the router.
///
/// Implementations hand work off to their own task; none of these calls may block.
pub trait Worker: Send {
    /// Hands a query to the worker. Queries for one worker must be processed in the order they
    /// are sent. A worker that is already terminating drops the query, which answers it with a
    /// retry-later error.
    fn send(&self, query: Query);

    /// Asks the worker to terminate. The worker reports back through [`WorkerEvents::stopped`].
    fn close(&self);

    /// Read-only snapshot for statistics.
    fn info(&self) -> WorkerInfo;
}

/// Creates workers for new tokens.
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, context: WorkerContext) -> Box<dyn Worker>;
}

/// Everything a new worker is bound to.
pub struct WorkerContext {
    pub id: WorkerId,
    pub token: String,
    pub is_test_dc: bool,
    pub tenant_id: u64,
    pub shard_key: ShardKey,
    pub stats: Arc<WorkerStats>,
    pub events: WorkerEvents,
    pub update_log: Arc<dyn UpdateLog>,
    pub webhook_store: Arc<dyn WebhookStore>,
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub tenant_id: u64,
    pub username: String,
    pub started_at: Instant,
    pub webhook: Option<WebhookSummary>,
    pub head_update_id: u64,
    pub tail_update_id: u64,
    pub pending_update_count: u64,
}

/// The worker's channel back to the router.
///
/// The router learns exactly once that the worker has stopped: either through
/// [`WorkerEvents::stopped`] or, if the worker goes away without saying so, when this value is
/// dropped.
#[derive(Debug)]
pub struct WorkerEvents {
    id: WorkerId,
    mailbox: mpsc::UnboundedSender<ManagerMessage>,
    stopped: bool,
}

impl WorkerEvents {
    pub(crate) fn new(id: WorkerId, mailbox: mpsc::UnboundedSender<ManagerMessage>) -> Self {
        Self {
            id,
            mailbox,
            stopped: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Reports whether the worker is currently consuming its update log.
    pub fn set_active(&self, active: bool) {
        let _ = self.mailbox.send(ManagerMessage::WorkerActive {
            id: self.id,
            active,
        });
    }

    /// Reports termination. After this the router erases the worker.
    pub fn stopped(mut self) {
        self.notify_stopped();
    }

    fn notify_stopped(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let _ = self
                .mailbox
                .send(ManagerMessage::WorkerStopped { id: self.id });
        }
    }
}

impl Drop for WorkerEvents {
    fn drop(&mut self) {
        self.notify_stopped();
    }
}

/// The router's record of one live worker.
pub(crate) struct WorkerHandle {
    /// Creation order; never reused, unlike slot indices.
    pub(crate) seq: u64,
    pub(crate) key: String,
    pub(crate) token: String,
    pub(crate) is_test_dc: bool,
    pub(crate) shard_key: ShardKey,
    pub(crate) stats: Arc<WorkerStats>,
    pub(crate) worker: Box<dyn Worker>,
    pub(crate) active: bool,
}
