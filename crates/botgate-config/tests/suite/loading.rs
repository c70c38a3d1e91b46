use std::time::Duration;

use botgate_config::{ConfigError, GatewayConfig, OnStall};
use botgate_router::{ManagerConfig, StallAction, TokenRange};
use pretty_assertions::assert_eq;

#[test]
fn empty_document_matches_router_defaults() {
    let config = GatewayConfig::load_from_str("").expect("empty config is valid");
    assert_eq!(config, GatewayConfig::default());

    let manager = config.manager_config();
    let defaults = ManagerConfig::default();
    assert_eq!(manager.token_range, TokenRange::ALL);
    assert_eq!(manager.flood_limits, defaults.flood_limits);
    assert_eq!(manager.gc, defaults.gc);
    assert_eq!(manager.maintenance_interval, Duration::from_millis(25));
    assert_eq!(manager.stats_top_count, 50);
    assert_eq!(manager.dump_top_count, 10);
    let watchdog = manager.watchdog.expect("watchdog enabled by default");
    assert_eq!(watchdog.timeout, Duration::from_millis(250));
    assert!(matches!(watchdog.on_stall, StallAction::Abort));
}

#[test]
fn every_section_is_read() {
    let text = r#"
[router]
rem = 2
mod = 3
stats_top_count = 20
dump_top_count = 5

[flood_control]
tiers = [{ period_secs = 10, max_events = 2 }]

[watchdog]
enabled = true
timeout_ms = 1000
on_stall = "log"

[gc]
initial_delay_secs = 30
retry_delay_secs = 2
idle_delay_secs = 120
report_threshold = 50

[storage]
working_dir = "/var/lib/botgate"

[logging]
level = "debug"
json = true
stderr = false
"#;
    let config = GatewayConfig::load_from_str(text).expect("valid config");
    assert_eq!(config.watchdog.on_stall, OnStall::Log);
    assert_eq!(config.storage.working_dir.to_str(), Some("/var/lib/botgate"));
    assert!(config.logging.json);
    assert!(!config.logging.stderr);

    let manager = config.manager_config();
    assert_eq!(manager.token_range, TokenRange { rem: 2, modulus: 3 });
    assert_eq!(manager.flood_limits.len(), 1);
    assert_eq!(manager.flood_limits[0].period, Duration::from_secs(10));
    assert_eq!(manager.flood_limits[0].max_events, 2);
    assert_eq!(manager.maintenance_interval, Duration::from_millis(100));
    assert_eq!(manager.gc.initial_delay, Duration::from_secs(30));
    assert_eq!(manager.gc.retry_delay, Duration::from_secs(2));
    assert_eq!(manager.gc.idle_delay, Duration::from_secs(120));
    assert_eq!(manager.gc.report_threshold, 50);
    assert_eq!(manager.stats_top_count, 20);
    assert!(matches!(
        manager.watchdog.map(|w| w.on_stall),
        Some(StallAction::Log)
    ));
}

#[test]
fn disabled_watchdog_keeps_the_maintenance_cadence() {
    let config = GatewayConfig::load_from_str("[watchdog]\nenabled = false\ntimeout_ms = 500\n")
        .expect("valid config");
    let manager = config.manager_config();
    assert!(manager.watchdog.is_none());
    assert_eq!(manager.maintenance_interval, Duration::from_millis(50));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = GatewayConfig::load_from_str("[router]\nshard = 1\n").expect_err("unknown key");
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");

    let err = GatewayConfig::load_from_str("[metrics]\nenabled = true\n").expect_err("unknown table");
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");
}

#[test]
fn loads_from_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("botgate.toml");
    std::fs::write(&path, "[router]\nrem = 1\nmod = 4\n").expect("write config");

    let config = GatewayConfig::load_from_path(&path).expect("load config");
    assert_eq!(config.router.rem, 1);
    assert_eq!(config.router.modulus, 4);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    let err = GatewayConfig::load_from_path(&path).expect_err("file does not exist");
    match err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, path.display().to_string()),
        other => panic!("unexpected error: {other}"),
    }
}
