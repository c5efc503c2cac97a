use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    pub node_url: String,
    pub restart_delay: Duration,
    pub subscriber_buffer: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "lookout-hub",
    author,
    version,
    about = "Streams block heads from a Tezos node to dashboard websockets"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "LOOKOUT_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Base URL of the Octez node RPC. Empty leaves the upstream feed unconfigured.
    #[arg(long, env = "OCTEZ_NODE_URL", default_value = "http://localhost:8732")]
    pub node_url: String,

    /// Delay before reopening the head stream after it ends on its own.
    #[arg(long, env = "LOOKOUT_RESTART_DELAY_SECS", default_value_t = 5)]
    pub restart_delay_secs: u64,

    /// Per-subscriber outbound queue depth; blocks beyond it are dropped for that subscriber.
    #[arg(long, env = "LOOKOUT_SUBSCRIBER_BUFFER", default_value_t = 64)]
    pub subscriber_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "LOOKOUT_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,

    /// Log filter directives, used when `RUST_LOG` is unset.
    #[arg(long, env = "LOOKOUT_LOG", default_value = "info")]
    pub log_filter: String,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "LOOKOUT_OTEL_STDOUT")]
    pub otel_stdout: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {source}")]
    ListenAddr {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("subscriber buffer must be greater than zero")]
    ZeroSubscriberBuffer,
}

impl TryFrom<Cli> for HubConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr = cli
            .listen_addr
            .parse()
            .map_err(|source| ConfigError::ListenAddr {
                addr: cli.listen_addr.clone(),
                source,
            })?;
        if cli.subscriber_buffer == 0 {
            return Err(ConfigError::ZeroSubscriberBuffer);
        }
        Ok(HubConfig {
            listen_addr,
            node_url: cli.node_url.trim().to_string(),
            restart_delay: Duration::from_secs(cli.restart_delay_secs),
            subscriber_buffer: cli.subscriber_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
