pub mod bridge;
pub mod config;
pub mod gateway;
pub mod mqtt;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{parse_level, Config};

/// Bridges Xiaomi gateways on the local network to an MQTT broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file
    config: Option<PathBuf>,

    /// Overrides `log_level` from the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = Config::resolve_path(cli.config).await;
    let config = Config::load(path.as_deref()).await?;

    let level = cli
        .log_level
        .as_deref()
        .and_then(parse_level)
        .unwrap_or_else(|| config.log_level());
    setup(level)?;

    info!("Starting {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config);
    config.validate();

    bridge::service::run(config).await
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}
