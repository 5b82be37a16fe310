use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "harbor", version)]
#[command(about = "Boat/viewer signaling relay, plus boat and probe clients")]
pub struct Cli {
    #[command(flatten)]
    pub serve: ServeArgs,

    /// Run as the coordinator when no command is given
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register as a boat and publish an SDP offer
    Boat(BoatArgs),
    /// Connect as a viewer, list boats and measure control-channel latency
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BoatArgs {
    /// Boat identifier announced to the coordinator
    #[arg(long, env = "HARBOR_BOAT_ID")]
    pub boat_id: String,

    /// Coordinator base URL (e.g. ws://localhost:8080)
    #[arg(long, env = "HARBOR_URL", default_value = "ws://localhost:8080")]
    pub url: String,

    /// Tried when the primary URL refuses the connection
    #[arg(long, env = "HARBOR_FALLBACK_URL")]
    pub fallback_url: Option<String>,

    /// File containing the SDP offer to publish
    #[arg(long, conflicts_with = "offer")]
    pub offer_file: Option<PathBuf>,

    /// SDP offer given inline
    #[arg(long)]
    pub offer: Option<String>,

    #[arg(long, default_value_t = 160)]
    pub width: u32,

    #[arg(long, default_value_t = 120)]
    pub height: u32,

    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Seconds between keepalive pings
    #[arg(long, default_value_t = 20)]
    pub heartbeat_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Coordinator base URL (e.g. ws://localhost:8080)
    #[arg(long, env = "HARBOR_URL", default_value = "ws://localhost:8080")]
    pub url: String,

    /// Number of pings to send
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: u32,

    /// Also request the offer of this boat
    #[arg(long)]
    pub boat_id: Option<String>,

    #[arg(long, default_value = "harbor-probe")]
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn bare_invocation_serves() {
        let cli = Cli::try_parse_from(["harbor"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.max_malformed, 5);
    }

    #[test_timeout::timeout]
    fn offer_sources_conflict() {
        let err = Cli::try_parse_from([
            "harbor",
            "boat",
            "--boat-id",
            "b1",
            "--offer",
            "v=0",
            "--offer-file",
            "offer.sdp",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test_timeout::timeout]
    fn probe_defaults() {
        let cli = Cli::try_parse_from(["harbor", "probe", "-n", "3"]).unwrap();
        match cli.command {
            Some(Commands::Probe(args)) => {
                assert_eq!(args.count, 3);
                assert_eq!(args.url, "ws://localhost:8080");
                assert!(args.boat_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
