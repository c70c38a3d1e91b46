use std::time::Duration;

use anyhow::Result;
use botgate_router::{FloodLimit, ManagerConfig, QueryError};

use super::support::{config, token, Harness};

fn limited(max_events: usize) -> ManagerConfig {
    ManagerConfig {
        flood_limits: vec![FloodLimit::new(Duration::from_secs(60), max_events)],
        ..config()
    }
}

#[tokio::test(start_paused = true)]
async fn creation_beyond_the_limit_waits_for_the_hint() -> Result<()> {
    let harness = Harness::start(limited(3))?;
    let peer = "203.0.113.9:40000";

    for tenant in 1..=3 {
        harness.query_from(&token(tenant), "getMe", peer).await?;
    }
    let err = harness
        .query_from(&token(4), "getMe", peer)
        .await
        .expect_err("fourth creation from the same address");
    let retry_after = err.retry_after().expect("retry hint");
    assert!(matches!(err, QueryError::RateLimited { .. }));
    assert_eq!(err.status(), 429);
    assert!((1..=60).contains(&retry_after), "retry_after = {retry_after}");
    assert_eq!(harness.factory.spawn_count(), 3);

    tokio::time::sleep(Duration::from_secs(retry_after)).await;
    harness.query_from(&token(4), "getMe", peer).await?;
    assert_eq!(harness.factory.spawn_count(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn existing_workers_bypass_admission() -> Result<()> {
    let harness = Harness::start(limited(1))?;
    let peer = "198.51.100.7:1234";

    harness.query_from(&token(1), "getMe", peer).await?;
    for _ in 0..5 {
        harness.query_from(&token(1), "getUpdates", peer).await?;
    }
    assert!(harness.query_from(&token(2), "getMe", peer).await.is_err());
    assert_eq!(harness.factory.spawn_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn equivalent_addresses_share_a_limiter() -> Result<()> {
    let harness = Harness::start(limited(1))?;

    harness.query_from(&token(1), "getMe", "192.0.2.1:80").await?;
    let err = harness
        .query_from(&token(2), "getMe", "[::ffff:192.0.2.1]:443")
        .await
        .expect_err("same host through a mapped address");
    assert_eq!(err.retry_after(), Some(60));

    harness.query_from(&token(3), "getMe", "192.0.2.2:80").await?;
    assert_eq!(harness.factory.spawn_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_attempts_are_not_recorded() -> Result<()> {
    let harness = Harness::start(limited(1))?;
    let peer = "192.0.2.50";

    harness.query_from(&token(1), "getMe", peer).await?;
    tokio::time::sleep(Duration::from_secs(30)).await;
    for tenant in 2..5 {
        assert!(harness.query_from(&token(tenant), "getMe", peer).await.is_err());
    }
    tokio::time::sleep(Duration::from_secs(31)).await;
    harness.query_from(&token(5), "getMe", peer).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_sources_are_not_limited() -> Result<()> {
    let harness = Harness::start(limited(1))?;

    for tenant in 1..=3 {
        harness.query(&token(tenant), "getMe").await?;
    }
    for tenant in 4..=6 {
        harness.query_from(&token(tenant), "getMe", "not an address").await?;
    }
    assert_eq!(harness.factory.spawn_count(), 6);
    Ok(())
}
