//! The `bridge` subcommand: relay commands onto the base's serial port.

use std::{
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use anyhow::{Context, Result};
use robot_link::{SerialBridge, SerialLink};
use tracing::info;

use crate::config::AppConfig;

pub(crate) fn run(config: &AppConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let settings = &config.bridge;
    let link = SerialLink::new(
        settings.serial_port.clone(),
        settings.baud_rate,
        Duration::from_millis(settings.settle_ms),
    );
    let mut bridge = SerialBridge::new(link, settings.options());

    info!(
        "bridging {} -> {} @ {} baud",
        settings.relay_url, settings.serial_port, settings.baud_rate
    );
    bridge
        .run(&shutdown)
        .with_context(|| format!("bridge to {} stopped", settings.relay_url))?;
    info!("bridge stopped");
    Ok(())
}
