use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use botgate_config::{init_tracing, GatewayConfig};
use clap::Parser;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(
    name = "botgate",
    version,
    about = "Bot API gateway router (JSON-lines requests on stdin, replies on stdout)"
)]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding persisted webhooks (overrides `storage.working_dir`)
    #[arg(long)]
    working_dir: Option<PathBuf>,
    /// Log level or filter directives (overrides `logging.level`)
    #[arg(long)]
    log_level: Option<String>,
    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load_from_path(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(working_dir) = cli.working_dir {
        config.storage.working_dir = working_dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    config.validate()?;
    init_tracing(&config.logging);

    let input = BufReader::new(tokio::io::stdin());
    botgate_server::run_with_shutdown(&config, input, tokio::io::stdout(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
