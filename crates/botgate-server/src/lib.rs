//! The botgate gateway process: a router backed by loopback workers, a file-backed webhook store
//! and an in-memory update log, fed by a JSON-lines console.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use botgate_config::GatewayConfig;
use botgate_metrics::ServerCounters;
use botgate_router::{FileWebhookStore, Manager, ManagerServices, MemoryUpdateLog};
use tokio::io::{AsyncBufRead, AsyncWrite};

pub mod console;
pub mod loopback;

pub use loopback::LoopbackFactory;

const TARGET: &str = "botgate.server";

/// Runs the gateway until `input` is exhausted or `shutdown` resolves, then closes the router and
/// waits for it to stop.
pub async fn run_with_shutdown<R, W, F>(
    config: &GatewayConfig,
    input: R,
    output: W,
    shutdown: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let working_dir = &config.storage.working_dir;
    let webhook_store = FileWebhookStore::open(working_dir)
        .with_context(|| format!("open webhook store in {}", working_dir.display()))?;
    let counters = Arc::new(ServerCounters::default());
    let services = ManagerServices {
        factory: Arc::new(LoopbackFactory),
        update_log: Arc::new(MemoryUpdateLog::new()),
        webhook_store: Arc::new(webhook_store),
        counters: Arc::clone(&counters),
    };
    let handle = Manager::start(config.manager_config(), services).context("start router")?;
    tracing::info!(
        target: TARGET,
        working_dir = %working_dir.display(),
        rem = config.router.rem,
        modulus = config.router.modulus,
        "gateway started"
    );

    let served = tokio::select! {
        served = console::serve(&handle, &counters, input, output) => served,
        () = shutdown => {
            tracing::info!(target: TARGET, "shutdown requested");
            Ok(())
        }
    };

    handle.close().await;
    tracing::info!(target: TARGET, "gateway stopped");
    served
}
