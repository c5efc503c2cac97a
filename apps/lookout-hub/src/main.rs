use anyhow::Result;
use clap::Parser;
use lookout_hub::{
    telemetry::{Telemetry, TelemetryConfig},
    Cli, HubConfig,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(&TelemetryConfig::from(&cli))?;

    let config = HubConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        node_url = %config.node_url,
        restart_delay_secs = config.restart_delay.as_secs(),
        "starting lookout hub"
    );

    lookout_hub::run(config, telemetry.metrics_handle()).await
}
