//! Task Farm control center server.

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskfarm_control_center::{http, AppState, Config};

/// Task Farm control center.
#[derive(Parser, Debug)]
#[command(name = "taskfarm-control-center", about = "Task Farm control center server")]
struct Args {
    /// HTTP server address
    #[arg(long, default_value = "[::1]:8100")]
    bind_addr: String,

    /// Interval at which agents are expected to sync, in seconds
    #[arg(long, default_value = "30")]
    sync_interval: u64,

    /// Period of the connection and timeout sweep, in seconds
    #[arg(long, default_value = "5")]
    sweep_interval: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind_addr,
            sync_interval_secs: args.sync_interval,
            sweep_interval_secs: args.sweep_interval,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskfarm=info".parse()?))
        .with_target(true)
        .init();

    let config = Config::from(Args::parse());
    let addr: SocketAddr = config.bind_addr.parse()?;
    let timeouts = config.timeouts();

    let state = AppState::new(config);
    let _sweeper = state.start_sweeper();
    let router = http::create_router(state);

    info!(
        addr = %addr,
        warn_after_secs = timeouts.warn.as_secs(),
        lost_after_secs = timeouts.lost.as_secs(),
        "Starting Task Farm control center"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
