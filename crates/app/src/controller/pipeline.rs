//! Controller supervisor: capture, detect, predict and command in one loop.
//!
//! The frame source runs on its own thread; this loop polls its latest frame,
//! drives [`ControlCycle`] and pushes commands through a shared
//! [`CommandChannel`]. A watchdog halts the base and restarts the pipeline
//! when either stage stops beating.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use intercept::VelocityCommand;
use ml_core::{Detector, replay::ReplayDetector};
use robot_link::{CommandChannel, WsConnector};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureDevice, FrameSource, SYNTHETIC_URI, SourceStatus, SyntheticCamera};

use super::{
    cycle::{ControlCycle, CycleOutcome},
    watchdog::{HealthComponent, PipelineHealth, StallLatch, spawn_watchdog},
};
use crate::{
    config::{AppConfig, CameraConfig, DetectorConfig},
    status::{self, StatusSource},
};

type SharedChannel = Arc<CommandChannel<WsConnector>>;

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Run the controller until `shutdown` is set or the restart budget is spent.
pub(crate) fn run(config: &AppConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut detector = build_detector(&config.detector)?;

    let channel: SharedChannel = Arc::new(CommandChannel::websocket(
        config.link.relay_url.clone(),
        config.link.channel_options(),
    ));
    if let Err(err) = channel.connect() {
        warn!("relay {} unavailable at startup: {err}", channel.endpoint());
    }

    let status_server = match &config.telemetry.status_bind {
        Some(bind) => Some(status::spawn_status_server(bind, StatusSource::Controller)?),
        None => None,
    };

    let mut restarts: u32 = 0;
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }

        match run_pipeline_once(config, detector.as_mut(), &channel, &shutdown) {
            Ok(PipelineOutcome::Graceful) => break Ok(()),
            Ok(PipelineOutcome::Restart(reason)) => {
                restarts = restarts.saturating_add(1);
                metrics::counter!("controller_pipeline_restarts_total").increment(1);
                if restarts > config.camera.max_restarts {
                    error!("pipeline restarted {restarts} times (last: {reason}); giving up");
                    break Err(anyhow::anyhow!(
                        "controller pipeline failed after {} restarts: {reason}",
                        config.camera.max_restarts
                    ));
                }
                warn!("pipeline restart requested (reason: {reason}), attempt #{restarts}");
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    break Ok(());
                }
                restarts = restarts.saturating_add(1);
                if restarts > config.camera.max_restarts {
                    break Err(err.context("controller pipeline failed"));
                }
                error!("controller pipeline error: {err:?}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    };

    info!("stopping controller");
    channel.disconnect();
    if let Some(server) = status_server {
        server.stop();
    }
    result
}

fn run_pipeline_once(
    config: &AppConfig,
    detector: &mut dyn Detector,
    channel: &SharedChannel,
    shutdown: &Arc<AtomicBool>,
) -> Result<PipelineOutcome> {
    let camera = open_camera(&config.camera, config.detector.input_size)?;
    let pipeline_span = tracing::info_span!(
        "controller.pipeline",
        source = %camera.describe(),
        relay = %channel.endpoint()
    );
    let _pipeline_guard = pipeline_span.enter();

    let mut source = FrameSource::new(camera, config.camera.capture_options());
    source.start()?;

    let health = Arc::new(PipelineHealth::new());
    let running = Arc::new(AtomicBool::new(true));
    let stall_latch = Arc::new(StallLatch::default());
    let stall_channel = channel.clone();
    let watchdog_handle = spawn_watchdog(
        health.clone(),
        running.clone(),
        shutdown.clone(),
        stall_latch.clone(),
        move || send_stop(&stall_channel),
    );

    let mut cycle = ControlCycle::new(config);
    let mut last_sequence: u64 = 0;
    let mut restart_reason: Option<&'static str> = None;

    while running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if source.status() == SourceStatus::Failed {
            error!("frame source failed");
            restart_reason = Some("capture failed");
            break;
        }

        let Some(frame) = source.get_frame() else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        if frame.sequence == last_sequence {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        last_sequence = frame.sequence;
        health.beat(HealthComponent::Capture);

        let started = Instant::now();
        let _cycle_guard = tracing::info_span!("control.cycle", frame = frame.sequence).entered();
        let detections = match detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                warn!("detector failed on frame {}: {err:#}", frame.sequence);
                metrics::counter!("intercept_detector_errors_total").increment(1);
                health.beat(HealthComponent::Control);
                continue;
            }
        };
        metrics::counter!("intercept_frames_processed_total").increment(1);

        let outcome = cycle.step(
            (frame.width, frame.height),
            frame.timestamp_secs(),
            &detections,
        );
        if let CycleOutcome::Command { command, landing } = outcome {
            debug!(
                "landing ({:.3}, {:.3}) in {:.3}s -> vy={:.3} vx={:.3}",
                landing.x, landing.y, landing.time_to_impact, command.vy, command.vx
            );
            match channel.send(&command) {
                Ok(()) => metrics::counter!("intercept_commands_sent_total").increment(1),
                Err(err) => {
                    metrics::counter!("intercept_command_send_failures_total").increment(1);
                    debug!("command not delivered: {err}");
                }
            }
        }
        metrics::histogram!("intercept_cycle_latency_seconds")
            .record(started.elapsed().as_secs_f64());
        health.beat(HealthComponent::Control);
    }

    running.store(false, Ordering::SeqCst);
    let _ = watchdog_handle.join();
    source.stop();

    if let Some(component) = stall_latch.tripped() {
        return Ok(PipelineOutcome::Restart(component.label()));
    }
    if let Some(reason) = restart_reason {
        send_stop(channel);
        return Ok(PipelineOutcome::Restart(reason));
    }
    Ok(PipelineOutcome::Graceful)
}

fn send_stop(channel: &CommandChannel<WsConnector>) {
    if let Err(err) = channel.send(&VelocityCommand::STOP) {
        warn!("failed to send stop command: {err}");
    }
}

fn build_detector(config: &DetectorConfig) -> Result<Box<dyn Detector>> {
    if let Some(path) = &config.replay {
        let detector = ReplayDetector::from_path(path)?;
        info!("replaying {} recorded cycles from {path}", detector.remaining());
        return Ok(Box::new(detector));
    }
    match &config.model {
        Some(model) => load_model(model, config),
        None => bail!("no detector configured: set detector.model or detector.replay"),
    }
}

#[cfg(feature = "with-tch")]
fn load_model(path: &str, config: &DetectorConfig) -> Result<Box<dyn Detector>> {
    let side = i64::from(config.input_size);
    let detector = ml_core::detector::TorchDetector::new(path, (side, side))?
        .with_confidence_threshold(config.confidence);
    info!("loaded detector model {path}");
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_model(path: &str, _config: &DetectorConfig) -> Result<Box<dyn Detector>> {
    bail!("detector model {path} requires building with the `with-tch` feature")
}

fn open_camera(camera: &CameraConfig, side: i32) -> Result<Box<dyn CaptureDevice>> {
    if camera.uri == SYNTHETIC_URI {
        return Ok(Box::new(SyntheticCamera::new((side, side))));
    }
    open_hardware_camera(camera, side)
}

#[cfg(feature = "with-opencv")]
fn open_hardware_camera(camera: &CameraConfig, side: i32) -> Result<Box<dyn CaptureDevice>> {
    let device = video_ingest::OpenCvCamera::open(
        &camera.uri,
        (camera.width, camera.height),
        side,
        camera.fps,
        camera.warmup_frames,
    )?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "with-opencv"))]
fn open_hardware_camera(camera: &CameraConfig, _side: i32) -> Result<Box<dyn CaptureDevice>> {
    bail!(
        "camera {} requires building with the `with-opencv` feature (use `{SYNTHETIC_URI}` for a dry run)",
        camera.uri
    )
}
