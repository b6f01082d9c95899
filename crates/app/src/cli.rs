use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::AppConfig;

/// Status address the relay serves when none is configured.
const RELAY_STATUS_BIND: &str = "0.0.0.0:8001";

#[derive(Debug, Parser)]
#[command(name = "catcher", version, about = "Falling-object interception controller")]
pub struct Cli {
    /// TOML configuration file; built-in defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging and per-prediction diagnostics.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write a Chrome trace of pipeline spans to this file.
    #[arg(long, global = true)]
    pub chrome_trace: Option<PathBuf>,

    /// Serve /, /health and /metrics on this address.
    #[arg(long, global = true)]
    pub status_bind: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture, predict and stream velocity commands to the relay.
    Controller(ControllerArgs),
    /// Run the WebSocket relay between controllers and robots.
    Relay(RelayArgs),
    /// Forward relay commands to the base over a serial port.
    Bridge(BridgeArgs),
}

#[derive(Debug, Args)]
pub struct ControllerArgs {
    /// Camera index, device path, stream URI or `synthetic`.
    #[arg(long)]
    pub camera: Option<String>,
    #[arg(long)]
    pub relay_url: Option<String>,
    /// Replay detections from a JSON-lines file instead of running a model.
    #[arg(long)]
    pub replay: Option<String>,
    /// TorchScript detector model.
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Debug, Args)]
pub struct RelayArgs {
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Debug, Args)]
pub struct BridgeArgs {
    #[arg(long)]
    pub relay_url: Option<String>,
    #[arg(long)]
    pub serial_port: Option<String>,
    #[arg(long)]
    pub baud: Option<u32>,
}

impl Cli {
    /// Load the config file, merge command-line overrides, and validate.
    pub fn resolve_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut AppConfig) {
        config.telemetry.verbose = self.verbose;
        if let Some(path) = &self.chrome_trace {
            config.telemetry.chrome_trace = Some(path.display().to_string());
        }
        if let Some(bind) = &self.status_bind {
            config.telemetry.status_bind = Some(bind.clone());
        }

        match &self.command {
            Command::Controller(args) => {
                if let Some(camera) = &args.camera {
                    config.camera.uri = camera.clone();
                }
                if let Some(url) = &args.relay_url {
                    config.link.relay_url = url.clone();
                }
                if let Some(replay) = &args.replay {
                    config.detector.replay = Some(replay.clone());
                }
                if let Some(model) = &args.model {
                    config.detector.model = Some(model.clone());
                }
            }
            Command::Relay(args) => {
                if let Some(bind) = &args.bind {
                    config.relay.bind = bind.clone();
                }
                if config.telemetry.status_bind.is_none() {
                    config.telemetry.status_bind = Some(RELAY_STATUS_BIND.into());
                }
            }
            Command::Bridge(args) => {
                if let Some(url) = &args.relay_url {
                    config.bridge.relay_url = url.clone();
                }
                if let Some(port) = &args.serial_port {
                    config.bridge.serial_port = port.clone();
                }
                if let Some(baud) = args.baud {
                    config.bridge.baud_rate = baud;
                }
            }
        }
    }
}
