//! The `relay` subcommand: WebSocket fan-out plus the HTTP status server.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use robot_link::{RelayBroker, RelayServer};
use tracing::info;

use crate::{
    config::AppConfig,
    status::{self, StatusSource},
};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn run(config: &AppConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let broker = RelayBroker::shared();
    let status_server = match &config.telemetry.status_bind {
        Some(bind) => Some(status::spawn_status_server(
            bind,
            StatusSource::Relay(broker.clone()),
        )?),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("relay-worker")
        .enable_all()
        .build()
        .context("failed to build relay runtime")?;

    let result = runtime.block_on(async {
        let server = RelayServer::bind_with(config.relay.bind.as_str(), broker)
            .await
            .with_context(|| format!("failed to bind relay on {}", config.relay.bind))?;

        tokio::select! {
            served = server.serve() => served.context("relay stopped accepting connections"),
            _ = wait_for_shutdown(&shutdown) => {
                info!("relay shutting down");
                Ok(())
            }
        }
    });

    runtime.shutdown_timeout(Duration::from_secs(1));
    if let Some(server) = status_server {
        server.stop();
    }
    result
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}
