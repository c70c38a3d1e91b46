//! Gateway configuration.
//!
//! A [`GatewayConfig`] is read from TOML; every section and field is optional and falls back to
//! the router's defaults. [`GatewayConfig::manager_config`] turns it into the router's
//! [`ManagerConfig`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, OnceLock};
use std::time::Duration;

use botgate_router::{
    FloodLimit, GcSchedule, ManagerConfig, StallAction, TokenRange, WatchdogConfig,
    DEFAULT_FLOOD_LIMITS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub router: RouterConfig,
    pub flood_control: FloodControlConfig,
    pub watchdog: WatchdogSection,
    pub gc: GcConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Which tenants this router serves and how much statistics it reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Serve tenants with `tenant_id % mod == rem`.
    pub rem: u64,
    #[serde(rename = "mod")]
    pub modulus: u64,
    pub stats_top_count: usize,
    pub dump_top_count: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let defaults = ManagerConfig::default();
        Self {
            rem: TokenRange::ALL.rem,
            modulus: TokenRange::ALL.modulus,
            stats_top_count: defaults.stats_top_count,
            dump_top_count: defaults.dump_top_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloodTier {
    pub period_secs: u64,
    pub max_events: usize,
}

/// Limits on creating workers for new tokens, per source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FloodControlConfig {
    pub tiers: Vec<FloodTier>,
}

impl Default for FloodControlConfig {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_FLOOD_LIMITS
                .iter()
                .map(|limit| FloodTier {
                    period_secs: limit.period.as_secs(),
                    max_events: limit.max_events,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnStall {
    #[default]
    Abort,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogSection {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub on_stall: OnStall,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: botgate_router::WATCHDOG_TIMEOUT.as_millis() as u64,
            on_stall: OnStall::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    pub initial_delay_secs: u64,
    pub retry_delay_secs: u64,
    pub idle_delay_secs: u64,
    pub report_threshold: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        let defaults = GcSchedule::default();
        Self {
            initial_delay_secs: defaults.initial_delay.as_secs(),
            retry_delay_secs: defaults.retry_delay.as_secs(),
            idle_delay_secs: defaults.idle_delay.as_secs(),
            report_threshold: defaults.report_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the persisted webhook registrations.
    pub working_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Also append logs to this file. If it cannot be opened, the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    /// `level` as filter directives: `warning` reads as `warn`, blank as `info`, anything other
    /// than a bare level passes through untouched.
    pub fn level_directives(&self) -> String {
        let level = self.level.trim();
        match level.to_ascii_lowercase().as_str() {
            "" => Self::default_level(),
            "warning" => "warn".to_owned(),
            bare @ ("trace" | "debug" | "info" | "warn" | "error") => bare.to_owned(),
            _ => level.to_owned(),
        }
    }

    /// The effective filter: `level`, with `RUST_LOG` merged in when set.
    pub fn env_filter(&self) -> EnvFilter {
        let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
        build_filter(&self.level_directives(), &rust_log)
    }
}

/// The first of `configured,overrides`, `overrides` and `configured` that parses, else `info`.
fn build_filter(configured: &str, overrides: &str) -> EnvFilter {
    let overrides = overrides.trim();
    let candidates = if overrides.is_empty() {
        vec![configured.to_owned()]
    } else {
        vec![
            format!("{configured},{overrides}"),
            overrides.to_owned(),
            configured.to_owned(),
        ]
    };
    candidates
        .iter()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Replaces the contents of every single- or double-quoted string in `message`.
fn redact_quoted(message: &str) -> String {
    static DOUBLE_QUOTED_RE: OnceLock<regex::Regex> = OnceLock::new();
    static SINGLE_QUOTED_RE: OnceLock<regex::Regex> = OnceLock::new();

    // Escaped quotes (`\"`) stay inside the match so the remainder of the value is not leaked.
    let double = DOUBLE_QUOTED_RE.get_or_init(|| {
        regex::Regex::new(r#""(?:\\.|[^"\\])*""#).expect("double-quoted regex should compile")
    });
    let single = SINGLE_QUOTED_RE.get_or_init(|| {
        regex::Regex::new(r#"'(?:\\.|[^'\\])*'"#).expect("single-quoted regex should compile")
    });

    let out = double.replace_all(message, r#""<redacted>""#);
    single.replace_all(&out, "'<redacted>'").into_owned()
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending source line, and the message itself may
        // echo a string value; either could be a bot token.
        ConfigError::Toml(redact_quoted(err.message()))
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

impl GatewayConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Parses and validates a TOML document.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let router = &self.router;
        if router.modulus == 0 {
            return Err(invalid("router.mod", "must be positive"));
        }
        if router.rem >= router.modulus {
            return Err(invalid(
                "router.rem",
                format!("must be less than router.mod ({})", router.modulus),
            ));
        }
        if self.flood_control.tiers.is_empty() {
            return Err(invalid("flood_control.tiers", "at least one tier is required"));
        }
        for tier in &self.flood_control.tiers {
            if tier.period_secs == 0 {
                return Err(invalid("flood_control.tiers.period_secs", "must be positive"));
            }
            if tier.max_events == 0 {
                return Err(invalid("flood_control.tiers.max_events", "must be positive"));
            }
        }
        if self.watchdog.timeout_ms == 0 {
            return Err(invalid("watchdog.timeout_ms", "must be positive"));
        }
        if self.gc.retry_delay_secs == 0 {
            return Err(invalid("gc.retry_delay_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let timeout = Duration::from_millis(self.watchdog.timeout_ms);
        let watchdog = self.watchdog.enabled.then(|| WatchdogConfig {
            timeout,
            on_stall: match self.watchdog.on_stall {
                OnStall::Abort => StallAction::Abort,
                OnStall::Log => StallAction::Log,
            },
        });

        ManagerConfig {
            token_range: TokenRange {
                rem: self.router.rem,
                modulus: self.router.modulus,
            },
            flood_limits: self
                .flood_control
                .tiers
                .iter()
                .map(|tier| FloodLimit::new(Duration::from_secs(tier.period_secs), tier.max_events))
                .collect(),
            watchdog,
            maintenance_interval: timeout / 10,
            gc: GcSchedule {
                initial_delay: Duration::from_secs(self.gc.initial_delay_secs),
                retry_delay: Duration::from_secs(self.gc.retry_delay_secs),
                idle_delay: Duration::from_secs(self.gc.idle_delay_secs),
                report_threshold: self.gc.report_threshold,
            },
            stats_top_count: self.router.stats_top_count,
            dump_top_count: self.router.dump_top_count,
            ..ManagerConfig::default()
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global tracing subscriber.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_failed = config.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(std::io::sink);
        if config.stderr {
            make_writer = BoxMakeWriter::new(make_writer.and(std::io::stderr));
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(Mutex::new(file)));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_failed {
            if let Some(path) = &config.file {
                tracing::warn!(
                    target: "botgate.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
