use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use crate::device::DeviceMode;

/// Flags for the coordinator itself (the default `harbor` command).
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP / WebSocket listener to.
    #[arg(long, env = "HARBOR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Close connections that stay silent for this long.
    #[arg(long, env = "HARBOR_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Time a new connection has to send boat_register or viewer_connect.
    #[arg(long, env = "HARBOR_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Malformed frames tolerated before a connection is dropped.
    #[arg(long, env = "HARBOR_MAX_MALFORMED", default_value_t = 5)]
    pub max_malformed: u32,

    /// Backend that executes control commands.
    #[arg(long, env = "HARBOR_DEVICE", value_enum, default_value_t = DeviceMode::Simulated)]
    pub device: DeviceMode,

    /// How long a relayed command waits for the boat's result.
    #[arg(long, env = "HARBOR_COMMAND_TIMEOUT_SECS", default_value_t = 10)]
    pub command_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "HARBOR_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_malformed: u32,
    pub device: DeviceMode,
    pub command_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            max_malformed: 5,
            device: DeviceMode::Simulated,
            command_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        anyhow::ensure!(args.idle_timeout_secs > 0, "idle timeout must be positive");
        anyhow::ensure!(
            args.handshake_timeout_secs > 0,
            "handshake timeout must be positive"
        );
        anyhow::ensure!(args.max_malformed > 0, "max malformed must be positive");
        anyhow::ensure!(
            args.command_timeout_secs > 0,
            "command timeout must be positive"
        );
        Ok(ServerConfig {
            listen_addr,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            max_malformed: args.max_malformed,
            device: args.device,
            command_timeout: Duration::from_secs(args.command_timeout_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
