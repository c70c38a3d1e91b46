use anyhow::Result;
use botgate_router::{ManagerConfig, QueryRequest, StatsSnapshot};
use pretty_assertions::assert_eq;

use super::support::{capture_logs, config, request, token, Harness};

#[tokio::test(start_paused = true)]
async fn busiest_workers_come_first() -> Result<()> {
    let harness = Harness::start(config())?;
    for (tenant, queries) in [(1, 3), (2, 1), (3, 5), (4, 1)] {
        for _ in 0..queries {
            harness.query(&token(tenant), "getMe").await?;
        }
    }

    let snapshot = harness.handle.stats("").await;
    let stats = snapshot.ready().expect("running");
    let tenants: Vec<u64> = stats.workers.iter().map(|block| block.tenant_id).collect();
    // Equal scores fall back to creation order.
    assert_eq!(tenants, vec![3, 1, 2, 4]);

    let aggregates = stats.aggregates.as_ref().expect("unfiltered request");
    assert_eq!(aggregates.worker_count, 4);
    assert_eq!(aggregates.active_worker_count, 4);
    assert_eq!(aggregates.server.request_count, 10);
    assert_eq!(stats.workers[0].stats.request_count, 5);
    assert_eq!(stats.workers[0].username, "bot3");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn equal_scores_keep_creation_order_across_reused_slots() -> Result<()> {
    let harness = Harness::start(config())?;
    harness.query(&token(1), "getMe").await?;
    harness.query(&token(2), "getMe").await?;
    harness.query(&token(1), "close").await?;
    harness.sync().await;
    harness.query(&token(3), "getMe").await?;

    let snapshot = harness.handle.stats("").await;
    let stats = snapshot.ready().expect("running");
    // Tenant 3 took over tenant 1's slot but was created after tenant 2.
    assert_eq!(stats.workers[1].worker_id.index(), 0);
    let tenants: Vec<u64> = stats.workers.iter().map(|block| block.tenant_id).collect();
    assert_eq!(tenants, vec![2, 3]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn top_count_bounds_the_worker_list() -> Result<()> {
    let harness = Harness::start(ManagerConfig {
        stats_top_count: 2,
        ..config()
    })?;
    for tenant in 1..=5 {
        harness.query(&token(tenant), "getMe").await?;
    }

    let snapshot = harness.handle.stats("").await;
    let stats = snapshot.ready().expect("running");
    assert_eq!(stats.workers.len(), 2);
    assert_eq!(stats.aggregates.as_ref().map(|a| a.worker_count), Some(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn key_filter_selects_by_prefix_and_skips_aggregates() -> Result<()> {
    let harness = Harness::start(config())?;
    for tenant in [11, 12, 21] {
        harness.query(&token(tenant), "getMe").await?;
    }

    let snapshot = harness.handle.stats("1").await;
    let stats = snapshot.ready().expect("running");
    assert!(stats.aggregates.is_none());
    let mut tenants: Vec<u64> = stats.workers.iter().map(|block| block.tenant_id).collect();
    tenants.sort_unstable();
    assert_eq!(tenants, vec![11, 12]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn raw_tokens_never_appear_in_statistics() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = token(42);
    harness.query(&token, "getMe").await?;

    let snapshot = harness.handle.stats("").await;
    let block = &snapshot.ready().expect("running").workers[0];
    assert_eq!(block.masked_token, "42:AAH...xyz");

    let json = serde_json::to_string(&snapshot)?;
    assert!(!json.contains(&token));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn active_shards_are_released_with_their_workers() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = token(9);
    harness.query(&token, "getMe").await?;
    harness
        .handle
        .route(QueryRequest {
            is_test_dc: true,
            ..request(&token, "getMe")
        })
        .recv()
        .await?;
    harness.query(&super::support::token(10), "getMe").await?;

    let active_shards = |snapshot: StatsSnapshot| {
        snapshot
            .ready()
            .and_then(|stats| stats.aggregates.as_ref())
            .map(|aggregates| aggregates.active_shard_count)
    };
    assert_eq!(active_shards(harness.handle.stats("").await), Some(3));

    harness.query(&token, "close").await?;
    assert_eq!(active_shards(harness.handle.stats("").await), Some(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn snapshot_serializes_in_camel_case() -> Result<()> {
    let harness = Harness::start(config())?;
    harness.query(&token(5), "getMe").await?;

    let value = serde_json::to_value(harness.handle.stats("").await)?;
    assert_eq!(value["state"], "ready");
    assert_eq!(value["workers"][0]["tenantId"], 5);
    assert_eq!(value["workers"][0]["isTestDc"], false);
    assert_eq!(value["aggregates"]["workerCount"], 1);
    assert!(value["aggregates"]["counters"]["pendingQueries"].is_u64());

    harness.handle.close().await;
    let value = serde_json::to_value(harness.handle.stats("").await)?;
    assert_eq!(value, serde_json::json!({ "state": "closing" }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn raw_tokens_never_appear_in_logs() -> Result<()> {
    let (logs, _guard) = capture_logs();

    let harness = Harness::start(config())?;
    let closed = token(77);
    let live = token(78);
    harness.query(&closed, "getMe").await?;
    harness.query(&closed, "close").await?;
    harness.query(&live, "getMe").await?;
    harness.handle.close().await;

    let text = logs.text();
    assert!(text.contains("created worker"), "{text}");
    assert!(text.contains("statistics at close"), "{text}");
    assert!(!text.contains(&closed));
    assert!(!text.contains(&live));
    Ok(())
}
