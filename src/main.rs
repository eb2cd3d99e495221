// vpf-730 - telemetry daemon for the Biral VPF-730 present weather sensor
//
// The daemon polls the sensor on a wall-clock cadence and delivers every
// measurement to two sinks: a local SQLite measurements table and a remote
// HTTP endpoint. Between producer and consumer sits a durable FIFO queue,
// also SQLite, so no measurement is lost across crashes or restarts.
//
// Architecture:
// - Producer (main task): cadence loop, sensor reads, queue puts
// - Queue (SQLite file): the only state shared between the two threads
// - Worker (background thread): leases messages, runs the task handlers,
//   acknowledges or retries; exhausted messages go to the dead letter table

mod cli;
mod config;
mod daemon;
mod measurement;
mod queue;
mod sensor;
mod tasks;
mod util;
mod worker;

use anyhow::Result;
use clap::Parser;
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    // configuration problems are fatal before anything starts
    let cfg = Config::resolve(&cli)?;

    // Precedence: RUST_LOG env var > default "vpf_730=info"
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "vpf_730=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Debug for Config redacts the API key
    tracing::info!(version = config::VERSION, ?cfg, "starting vpf-730");
    daemon::main_loop(cfg, daemon::DEFAULT_CADENCE_MIN).await
}
