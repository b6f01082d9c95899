mod bridge;
mod cli;
mod config;
mod controller;
mod relay;
mod status;
mod telemetry;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use tracing::warn;

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    let _telemetry_guard = telemetry::init(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl+C handler: {err}");
    }

    match &cli.command {
        Command::Controller(_) => controller::run(&config, shutdown),
        Command::Relay(_) => relay::run(&config, shutdown),
        Command::Bridge(_) => bridge::run(&config, shutdown),
    }
}
