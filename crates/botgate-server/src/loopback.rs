//! Workers that answer bot API calls locally instead of forwarding them upstream.
//!
//! Each worker runs as its own task and processes queries strictly in arrival order. Webhook
//! calls are persisted through the shared [`WebhookStore`]; every other method is echoed back and
//! appended to the tenant's shard of the [`UpdateLog`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use botgate_metrics::WorkerStats;
use botgate_router::query::{CLOSE_METHOD, DELETE_WEBHOOK_METHOD, SET_WEBHOOK_METHOD};
use botgate_router::token::webhook_key;
use botgate_router::{
    Query, QueryError, QueryResult, ShardKey, StoreError, UpdateLog, WebhookRegistration,
    WebhookStore, WebhookSummary, Worker, WorkerContext, WorkerEvents, WorkerFactory, WorkerInfo,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

const TARGET: &str = "botgate.loopback";

/// Lifetime of an echoed update in the update log.
const UPDATE_TTL_SECS: i64 = 86_400;

#[derive(Debug, Default)]
pub struct LoopbackFactory;

impl WorkerFactory for LoopbackFactory {
    fn spawn(&self, context: WorkerContext) -> Box<dyn Worker> {
        let shared = Arc::new(Shared {
            tenant_id: context.tenant_id,
            username: format!("loopback{}_bot", context.tenant_id),
            started_at: Instant::now(),
            shard_key: context.shard_key,
            update_log: Arc::clone(&context.update_log),
            state: Mutex::new(State::default()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let task = LoopbackTask {
            webhook_key: webhook_key(&context.token, context.is_test_dc),
            shared: Arc::clone(&shared),
            stats: context.stats,
            events: context.events,
            webhook_store: context.webhook_store,
        };
        tracing::debug!(
            target: TARGET,
            worker = %task.events.id(),
            tenant_id = context.tenant_id,
            is_test_dc = context.is_test_dc,
            "loopback worker started"
        );
        tokio::spawn(task.run(rx));

        Box::new(LoopbackWorker { tx, shared })
    }
}

#[derive(Debug, Default)]
struct State {
    webhook: Option<WebhookSummary>,
    head_update_id: u64,
    tail_update_id: u64,
}

/// Read by `info` on the router task, written by the worker task.
struct Shared {
    tenant_id: u64,
    username: String,
    started_at: Instant,
    shard_key: ShardKey,
    update_log: Arc<dyn UpdateLog>,
    state: Mutex<State>,
}

enum Command {
    Query(Query),
    Close,
}

struct LoopbackWorker {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Worker for LoopbackWorker {
    fn send(&self, query: Query) {
        // A stopped task has dropped its receiver; the returned query is dropped with the error.
        let _ = self.tx.send(Command::Query(query));
    }

    fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    fn info(&self) -> WorkerInfo {
        let state = self.shared.state.lock();
        WorkerInfo {
            tenant_id: self.shared.tenant_id,
            username: self.shared.username.clone(),
            started_at: self.shared.started_at,
            webhook: state.webhook.clone(),
            head_update_id: state.head_update_id,
            tail_update_id: state.tail_update_id,
            pending_update_count: self.shared.update_log.pending_count(self.shared.shard_key),
        }
    }
}

struct LoopbackTask {
    webhook_key: String,
    shared: Arc<Shared>,
    stats: Arc<WorkerStats>,
    events: WorkerEvents,
    webhook_store: Arc<dyn WebhookStore>,
}

impl LoopbackTask {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Query(query) => {
                    if self.handle(query) {
                        break;
                    }
                }
                Command::Close => break,
            }
        }

        // Anything still queued is answered with a retry-later error when dropped.
        commands.close();
        drop(commands);
        tracing::debug!(target: TARGET, worker = %self.events.id(), "loopback worker stopped");
        self.events.stopped();
    }

    /// Returns `true` once the worker should stop.
    fn handle(&self, query: Query) -> bool {
        let file_bytes = query
            .files()
            .iter()
            .map(|file| file.content.len() as u64)
            .sum();
        let request = self
            .stats
            .start_request(query.method(), query.files().len() as u64, file_bytes);

        let stop = query.method() == CLOSE_METHOD;
        let result = if stop { Ok(json!(true)) } else { self.dispatch(&query) };
        request.finish(result.is_ok());
        query.respond(result);
        stop
    }

    fn dispatch(&self, query: &Query) -> QueryResult {
        match query.method() {
            "getme" => Ok(json!({
                "id": self.shared.tenant_id,
                "is_bot": true,
                "first_name": "Loopback",
                "username": self.shared.username,
            })),
            SET_WEBHOOK_METHOD => self.set_webhook(query),
            DELETE_WEBHOOK_METHOD => self.delete_webhook(query),
            "getwebhookinfo" => Ok(self.webhook_info()),
            _ => self.echo(query),
        }
    }

    fn set_webhook(&self, query: &Query) -> QueryResult {
        let url = query.arg("url").map(str::trim).unwrap_or_default();
        if url.is_empty() {
            return self.delete_webhook(query);
        }

        let max_connections = query
            .arg("max_connections")
            .map(|value| {
                value
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|max| (1..=100).contains(max))
                    .ok_or_else(|| QueryError::BadRequest("invalid max_connections".to_owned()))
            })
            .transpose()?;
        let registration = WebhookRegistration {
            url: url.to_owned(),
            has_certificate: query.arg("certificate").is_some()
                || query.files().iter().any(|file| file.field_name == "certificate"),
            max_connections,
            ip_address: non_empty_arg(query, "ip_address"),
            fix_ip_address: query
                .arg("fix_ip_address")
                .is_some_and(|value| matches!(value, "1" | "true")),
            secret_token: non_empty_arg(query, "secret_token"),
            allowed_updates: non_empty_arg(query, "allowed_updates"),
        };

        // Restored registrations are already persisted.
        if !query.is_authorized() {
            self.webhook_store
                .put(&self.webhook_key, &registration.encode())
                .map_err(store_error)?;
        }

        tracing::info!(
            target: TARGET,
            worker = %self.events.id(),
            restored = query.is_authorized(),
            url = %registration.url,
            "webhook set"
        );
        self.shared.state.lock().webhook = Some(registration.summary());
        self.events.set_active(true);
        Ok(json!(true))
    }

    fn delete_webhook(&self, query: &Query) -> QueryResult {
        if !query.is_authorized() {
            self.webhook_store
                .erase(&self.webhook_key)
                .map_err(store_error)?;
        }
        let previous = self.shared.state.lock().webhook.take();
        if previous.is_some() {
            tracing::info!(target: TARGET, worker = %self.events.id(), "webhook deleted");
            self.events.set_active(false);
        }
        Ok(json!(true))
    }

    fn webhook_info(&self) -> serde_json::Value {
        let pending_update_count = self.shared.update_log.pending_count(self.shared.shard_key);
        let state = self.shared.state.lock();
        match &state.webhook {
            Some(webhook) => json!({
                "url": webhook.url,
                "has_custom_certificate": webhook.has_certificate,
                "max_connections": webhook.max_connections,
                "pending_update_count": pending_update_count,
            }),
            None => json!({
                "url": "",
                "has_custom_certificate": false,
                "pending_update_count": pending_update_count,
            }),
        }
    }

    fn echo(&self, query: &Query) -> QueryResult {
        let args: serde_json::Map<String, serde_json::Value> = query
            .args()
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();
        let payload = json!({ "method": query.method(), "args": args });

        let update_id = self
            .shared
            .update_log
            .append(
                self.shared.shard_key,
                unix_now() + UPDATE_TTL_SECS,
                payload.clone(),
            )
            .map_err(store_error)?;
        {
            let mut state = self.shared.state.lock();
            if state.head_update_id == 0 {
                state.head_update_id = update_id;
            }
            state.tail_update_id = update_id;
        }

        Ok(json!({ "update_id": update_id, "echo": payload }))
    }
}

fn non_empty_arg(query: &Query, name: &str) -> Option<String> {
    query
        .arg(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn store_error(err: StoreError) -> QueryError {
    tracing::warn!(target: TARGET, error = %err, "store operation failed");
    QueryError::Worker {
        status: 500,
        description: "Internal Server Error: storage unavailable".to_owned(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs() as i64)
}
