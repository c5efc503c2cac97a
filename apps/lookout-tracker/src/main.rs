use anyhow::{Context, Result};
use clap::Parser;
use lookout_tracker::{hub_endpoint, BlockStreamTracker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "lookout-tracker",
    author,
    version,
    about = "Follows a Lookout hub's block stream and prints head, age and drift"
)]
struct Cli {
    /// Origin the dashboard is served from; the websocket endpoint is derived from it.
    #[arg(long, env = "LOOKOUT_ORIGIN", default_value = "http://127.0.0.1:8080")]
    origin: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let endpoint = hub_endpoint(&cli.origin).context("cannot derive hub endpoint")?;
    info!(%endpoint, "following block stream");

    let tracker = BlockStreamTracker::new(endpoint).spawn();
    let mut snapshots = tracker.subscribe();
    println!("{}", *snapshots.borrow_and_update());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", *snapshots.borrow_and_update());
            }
        }
    }

    let last = tracker.shutdown().await;
    println!("{last}");
    Ok(())
}
