//! Tenant router for the botgate bot API gateway.
//!
//! Every inbound [`Query`] carries a bot token. The [`Manager`] validates the token, finds (or,
//! subject to per-source flood control, creates) the single worker serving that token, and
//! forwards the query to it. It also drives periodic maintenance (watchdog kicks, update-log
//! garbage collection) and the multi-phase shutdown: stop routing, close every worker, wait for
//! all of them, then close the stores.
//!
//! Workers themselves live behind the [`Worker`] / [`WorkerFactory`] traits; the durable stores
//! behind [`UpdateLog`] / [`WebhookStore`].

pub mod flood;
mod manager;
pub mod query;
pub mod stats;
pub mod store;
pub mod table;
pub mod token;
pub mod watchdog;
pub mod webhook;
mod worker;

pub use flood::{FloodControl, FloodControlTable, FloodLimit, DEFAULT_FLOOD_LIMITS};
pub use manager::{
    GcSchedule, Manager, ManagerConfig, ManagerHandle, ManagerServices, WatchdogConfig,
    WATCHDOG_TIMEOUT,
};
pub use query::{InputFile, Query, QueryError, QueryReply, QueryRequest, QueryResult};
pub use stats::{ServerAggregates, ServerStats, StatsSnapshot, WorkerStatBlock};
pub use store::{
    CloseCompletion, FileWebhookStore, GcOutcome, MemoryUpdateLog, MemoryWebhookStore,
    StoreError, UpdateLog, WebhookStore,
};
pub use table::{WorkerId, WorkerTable};
pub use token::{ShardKey, TokenError, TokenRange};
pub use watchdog::{StallAction, Watchdog};
pub use webhook::{WebhookRegistration, WebhookSummary};
pub use worker::{Worker, WorkerContext, WorkerEvents, WorkerFactory, WorkerInfo};
