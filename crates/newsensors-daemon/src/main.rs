//! newsensors - Main entry point
//!
//! Watches the aggregator for devices the world model does not know yet,
//! announces them as placeholders and retracts them once they are registered.

mod config;
mod solver;

use anyhow::Result;
use clap::Parser;
use newsensors_core::Shutdown;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "newsensors")]
#[command(about = "Announces devices heard by the aggregator that the world model does not know")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "newsensors.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write a default configuration to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("newsensors v{}", env!("CARGO_PKG_VERSION"));

    if args.write_default_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let config = config::load_config(&args.config)?;

    info!(
        aggregator = %format!("{}:{}", config.aggregator.host, config.aggregator.port),
        world_model = %config.world_model.host,
        interval_ms = config.solver.update_interval_ms,
        "Configuration loaded"
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            signal.trigger();
        }
    });

    if let Err(e) = solver::run(&config, shutdown).await {
        error!(error = %format!("{:#}", e), "Solver stopped");
        return Err(e);
    }

    info!("Solver exited cleanly");
    Ok(())
}
