use botgate_config::{ConfigError, FloodTier, GatewayConfig};

fn invalid_field(text: &str) -> &'static str {
    match GatewayConfig::load_from_str(text) {
        Err(ConfigError::Invalid { field, .. }) => field,
        Err(other) => panic!("expected a validation error, got {other}"),
        Ok(_) => panic!("expected a validation error for {text:?}"),
    }
}

#[test]
fn shard_range_must_be_consistent() {
    assert_eq!(invalid_field("[router]\nmod = 0\n"), "router.mod");
    assert_eq!(invalid_field("[router]\nrem = 3\nmod = 3\n"), "router.rem");
    assert!(GatewayConfig::load_from_str("[router]\nrem = 2\nmod = 3\n").is_ok());
}

#[test]
fn flood_tiers_must_be_usable() {
    assert_eq!(invalid_field("[flood_control]\ntiers = []\n"), "flood_control.tiers");
    assert_eq!(
        invalid_field("[flood_control]\ntiers = [{ period_secs = 0, max_events = 1 }]\n"),
        "flood_control.tiers.period_secs"
    );
    assert_eq!(
        invalid_field("[flood_control]\ntiers = [{ period_secs = 60, max_events = 0 }]\n"),
        "flood_control.tiers.max_events"
    );
}

#[test]
fn timers_must_be_positive() {
    assert_eq!(invalid_field("[watchdog]\ntimeout_ms = 0\n"), "watchdog.timeout_ms");
    assert_eq!(invalid_field("[gc]\nretry_delay_secs = 0\n"), "gc.retry_delay_secs");
}

#[test]
fn validate_checks_programmatic_configs_too() {
    let mut config = GatewayConfig::default();
    assert!(config.validate().is_ok());

    config.flood_control.tiers.push(FloodTier {
        period_secs: 1,
        max_events: 0,
    });
    let err = config.validate().expect_err("zero-event tier");
    assert_eq!(
        err.to_string(),
        "invalid value for `flood_control.tiers.max_events`: must be positive"
    );
}
