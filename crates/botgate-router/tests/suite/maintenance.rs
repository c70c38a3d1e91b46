use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use botgate_router::{GcOutcome, GcSchedule, ManagerConfig, StallAction, WatchdogConfig};
use pretty_assertions::assert_eq;
use tokio::time::{sleep, Instant};

use super::support::{capture_logs, config, token, Harness};

fn gc_config() -> ManagerConfig {
    ManagerConfig {
        gc: GcSchedule {
            initial_delay: Duration::from_secs(600),
            retry_delay: Duration::from_secs(1),
            idle_delay: Duration::from_secs(60),
            report_threshold: 10,
        },
        ..config()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs() as i64)
}

#[tokio::test(start_paused = true)]
async fn gc_runs_on_schedule_and_retries_sooner_when_unfinished() -> Result<()> {
    let started = Instant::now();
    let unix_start = unix_now();
    let harness = Harness::start(gc_config())?;
    harness.update_log.script_gc([
        GcOutcome {
            deleted: 25,
            finished: false,
        },
        GcOutcome {
            deleted: 3,
            finished: true,
        },
    ]);

    sleep(Duration::from_millis(599_500)).await;
    assert!(harness.update_log.gc_calls().is_empty());

    sleep(Duration::from_millis(600)).await;
    let calls = harness.update_log.gc_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].at - started >= Duration::from_secs(600));
    assert!(calls[0].cutoff >= unix_start + 600);
    assert!(calls[0].cutoff <= unix_now() + 601);

    // Unfinished pass: the next one follows after the short retry delay.
    sleep(Duration::from_secs(1)).await;
    let calls = harness.update_log.gc_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at < Duration::from_secs(2));
    assert!(calls[1].cutoff >= calls[0].cutoff);

    // Finished pass: the next one waits for the idle delay.
    sleep(Duration::from_secs(59)).await;
    assert_eq!(harness.update_log.gc_calls().len(), 2);
    sleep(Duration::from_secs(1)).await;
    let calls = harness.update_log.gc_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].at - calls[1].at >= Duration::from_secs(60));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn maintenance_stops_once_closed() -> Result<()> {
    let harness = Harness::start(ManagerConfig {
        gc: GcSchedule {
            initial_delay: Duration::from_secs(1),
            idle_delay: Duration::from_secs(1),
            ..GcSchedule::default()
        },
        ..config()
    })?;

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(harness.update_log.gc_calls().len(), 1);

    harness.handle.close().await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.update_log.gc_calls().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deleted_totals_are_reported_past_the_threshold() -> Result<()> {
    let (logs, _guard) = capture_logs();
    let harness = Harness::start(gc_config())?;
    harness.update_log.script_gc([
        GcOutcome {
            deleted: 4,
            finished: false,
        },
        GcOutcome {
            deleted: 8,
            finished: false,
        },
        GcOutcome {
            deleted: 5,
            finished: true,
        },
    ]);
    let reports = |text: &str| text.matches("garbage collected expired updates").count();

    sleep(Duration::from_millis(600_500)).await;
    assert_eq!(harness.update_log.gc_calls().len(), 1);
    assert_eq!(reports(&logs.text()), 0);

    sleep(Duration::from_secs(1)).await;
    let text = logs.text();
    assert_eq!(reports(&text), 1, "{text}");
    assert!(text.contains("deleted_total=12"), "{text}");

    // 17 does not exceed the last report (12) by more than the threshold.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.update_log.gc_calls().len(), 3);
    assert_eq!(reports(&logs.text()), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn maintenance_keeps_the_watchdog_fed() -> Result<()> {
    let stalls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stalls);
    let harness = Harness::start(ManagerConfig {
        watchdog: Some(WatchdogConfig {
            timeout: Duration::from_millis(100),
            on_stall: StallAction::Notify(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        }),
        maintenance_interval: Duration::from_millis(10),
        ..config()
    })?;
    harness.query(&token(1), "getMe").await?;

    sleep(Duration::from_millis(600)).await;
    assert_eq!(stalls.load(Ordering::SeqCst), 0);

    // Closing stops the watchdog along with the kicks.
    harness.handle.close().await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(stalls.load(Ordering::SeqCst), 0);
    Ok(())
}
