use anyhow::Result;
use clap::Parser;
use tracing::info;

use harbor::cli::{Cli, Commands};
use harbor::client::{run_boat, run_probe};
use harbor::config::ServerConfig;
use harbor::server;
use harbor::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Boat(args)) => {
            Telemetry::init(false)?;
            run_boat(args).await
        }
        Some(Commands::Probe(args)) => {
            Telemetry::init(false)?;
            run_probe(args).await
        }
        None => {
            let telemetry = Telemetry::init(true)?;
            let config = ServerConfig::try_from(cli.serve)?;
            info!(version = env!("CARGO_PKG_VERSION"), "starting harbor");
            server::run(config, telemetry.metrics_handle()).await
        }
    }
}
