use std::sync::Arc;

use anyhow::Result;
use botgate_router::{
    MemoryWebhookStore, QueryError, QueryRequest, ShardKey, TokenRange, WebhookStore,
};
use pretty_assertions::assert_eq;

use super::support::{config, request, token, FakeFactory, Harness};

#[tokio::test]
async fn distinct_tokens_get_distinct_workers() -> Result<()> {
    let harness = Harness::start(config())?;
    let (t1, t2) = (token(1), token(2));

    let first = harness.query(&t1, "getMe").await?;
    let second = harness.query(&t2, "getMe").await?;
    let again = harness.query(&t1, "getUpdates").await?;

    assert_eq!(harness.factory.spawn_count(), 2);
    assert_ne!(first["worker"], second["worker"]);
    assert_eq!(first["worker"], again["worker"]);
    assert_eq!(again["method"], "getupdates");
    Ok(())
}

#[tokio::test]
async fn malformed_tokens_are_unauthorized() -> Result<()> {
    let harness = Harness::start(config())?;
    let too_long = format!("1:{}", "a".repeat(80));
    let rejected = [
        "",
        "123",
        "0123:abc",
        "12/3:abc",
        "abc:def",
        "-5:abc",
        ":abc",
        "0:abc",
        "18014398509481984:abc",
        "99999999999999999999999:abc",
        too_long.as_str(),
    ];

    for bad in rejected {
        let err = harness
            .query(bad, "getMe")
            .await
            .expect_err("malformed token must be rejected");
        assert_eq!(err, QueryError::Unauthorized, "token {bad:?}");
        assert_eq!(err.status(), 401);
    }
    assert_eq!(harness.factory.spawn_count(), 0);
    Ok(())
}

#[tokio::test]
async fn tokens_outside_the_shard_are_misdirected() -> Result<()> {
    let harness = Harness::start(botgate_router::ManagerConfig {
        token_range: TokenRange { rem: 1, modulus: 2 },
        ..config()
    })?;

    let err = harness
        .query(&token(2), "getMe")
        .await
        .expect_err("even tenant belongs to another router");
    assert_eq!(err, QueryError::MisdirectedRequest);
    assert_eq!(err.status(), 421);
    assert_eq!(harness.factory.spawn_count(), 0);

    harness.query(&token(3), "getMe").await?;
    assert_eq!(harness.factory.spawn_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_environment_is_a_separate_tenant() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = "123456789:ABC";

    let production = harness.query(token, "getMe").await?;
    let test_dc = harness
        .handle
        .route(QueryRequest {
            is_test_dc: true,
            ..request(token, "getMe")
        })
        .recv()
        .await?;

    assert_ne!(production["worker"], test_dc["worker"]);
    let production_worker = harness.factory.worker(token, false).expect("production worker");
    let test_worker = harness.factory.worker(token, true).expect("test worker");
    assert_eq!(production_worker.shard_key, ShardKey::new(123_456_789, false));
    assert_eq!(test_worker.shard_key, ShardKey::new(123_456_789, true));
    assert_ne!(production_worker.shard_key, test_worker.shard_key);

    let test_only = harness.handle.stats("123456789:ABC/test").await;
    let blocks = &test_only.ready().expect("running").workers;
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].is_test_dc);
    Ok(())
}

#[tokio::test]
async fn close_without_a_worker_is_rejected() -> Result<()> {
    let harness = Harness::start(config())?;

    let err = harness
        .query(&token(7), "Close")
        .await
        .expect_err("nothing to close");
    assert_eq!(
        err,
        QueryError::BadRequest("the bot has already been closed".into())
    );
    assert_eq!(err.status(), 400);
    assert_eq!(harness.factory.spawn_count(), 0);
    Ok(())
}

#[tokio::test]
async fn queries_for_one_token_keep_their_order() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = token(11);

    let replies: Vec<_> = (0..10)
        .map(|i| harness.handle.route(request(&token, &format!("m{i}"))))
        .collect();
    for reply in replies {
        reply.recv().await?;
    }

    let worker = harness.factory.worker(&token, false).expect("worker");
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(worker.methods(), expected);
    Ok(())
}

#[tokio::test]
async fn stopped_worker_is_replaced_on_next_query() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = token(12);

    let first = harness.query(&token, "getMe").await?;
    assert_eq!(harness.query(&token, "close").await?, serde_json::json!(true));
    harness.sync().await;

    let second = harness.query(&token, "getMe").await?;
    assert_eq!(harness.factory.spawn_count(), 2);
    assert_ne!(first["worker"], second["worker"]);
    Ok(())
}

#[tokio::test]
async fn new_worker_restores_persisted_webhook_first() -> Result<()> {
    let restored = token(21);
    let explicit = token(22);
    let store = MemoryWebhookStore::new();
    let harness = Harness::start_with(config(), FakeFactory::new(), Arc::new(store))?;
    harness
        .webhooks
        .put(&restored, "cert/#maxc3/https://example.com/hook")?;
    harness.webhooks.put(&explicit, "https://example.com/old")?;

    harness.query(&restored, "getMe").await?;
    harness.query(&explicit, "setWebhook").await?;

    let worker = harness.factory.worker(&restored, false).expect("worker");
    let received = worker.received();
    assert_eq!(worker.methods(), vec!["setwebhook", "getme"]);
    assert!(received[0].authorized);
    assert!(!received[1].authorized);
    assert_eq!(
        received[0].args,
        vec![
            ("certificate".to_owned(), "previous".to_owned()),
            ("max_connections".to_owned(), "3".to_owned()),
            ("url".to_owned(), "https://example.com/hook".to_owned()),
        ]
    );

    let worker = harness.factory.worker(&explicit, false).expect("worker");
    assert_eq!(worker.methods(), vec!["setwebhook"]);
    assert!(!worker.received()[0].authorized);
    Ok(())
}

#[tokio::test]
async fn unusable_stored_webhook_is_ignored() -> Result<()> {
    let token = token(23);
    let store = MemoryWebhookStore::with_entries([(token.clone(), "#maxcmany/https://h".to_owned())]);
    let harness = Harness::start_with(config(), FakeFactory::new(), Arc::new(store))?;

    harness.query(&token, "getMe").await?;
    let worker = harness.factory.worker(&token, false).expect("worker");
    assert_eq!(worker.methods(), vec!["getme"]);
    Ok(())
}

#[tokio::test]
async fn terminating_worker_refuses_queries_without_a_respawn() -> Result<()> {
    let harness = Harness::start(config())?;
    let token = token(8);
    harness.query(&token, "getMe").await?;
    harness.factory.spawned()[0].begin_terminating();

    let err = harness
        .query(&token, "getMe")
        .await
        .expect_err("a terminating worker drops its queries");
    assert_eq!(err, QueryError::ServiceUnavailable);
    assert_eq!(err.status(), 429);
    assert_eq!(harness.factory.spawn_count(), 1);

    harness.factory.spawned()[0].stop();
    harness.query(&token, "getMe").await?;
    assert_eq!(harness.factory.spawn_count(), 2);
    Ok(())
}
