//! TOML configuration shared by every subcommand.
//!
//! Every section has defaults, so an absent file or a partial file is valid.
//! Command-line overrides are merged by `cli` before [`AppConfig::validate`].

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use intercept::{CommandGenerator, ObjectSizes, ProjectionBounds, TrajectoryParams};
use robot_link::{BridgeOptions, ChannelOptions};
use serde::{Deserialize, Serialize};
use video_ingest::CaptureOptions;

/// Finest trajectory resampling accepted from configuration, in seconds.
const MIN_TRAJECTORY_STEP: f64 = 0.001;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub projection: ProjectionConfig,
    pub objects: ObjectSizes,
    pub physics: PhysicsConfig,
    pub control: CommandGenerator,
    pub link: LinkConfig,
    pub relay: RelayConfig,
    pub bridge: BridgeConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index, `/dev/videoN`, a file/stream URI, or `synthetic`.
    pub uri: String,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub failure_threshold: u32,
    pub max_restarts: u32,
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            uri: "0".into(),
            width: 640,
            height: 480,
            fps: 30.0,
            failure_threshold: video_ingest::DEFAULT_FAILURE_THRESHOLD,
            max_restarts: 3,
            warmup_frames: 10,
        }
    }
}

impl CameraConfig {
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            fps: self.fps,
            failure_threshold: self.failure_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// TorchScript model; requires the `with-tch` feature.
    pub model: Option<String>,
    /// JSON-lines file of recorded detections.
    pub replay: Option<String>,
    pub confidence: f32,
    pub input_size: i32,
    /// Restrict targeting to these class ids; empty means any class.
    pub target_classes: Vec<i64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: None,
            replay: None,
            confidence: 0.30,
            input_size: 640,
            target_classes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Pixels.
    pub focal_length: f64,
    pub horizontal_limit: f64,
    pub height_limit: f64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        let bounds = ProjectionBounds::default();
        Self {
            focal_length: 1000.0,
            horizontal_limit: bounds.horizontal_limit,
            height_limit: bounds.height_limit,
        }
    }
}

impl ProjectionConfig {
    pub fn bounds(&self) -> ProjectionBounds {
        ProjectionBounds {
            horizontal_limit: self.horizontal_limit,
            height_limit: self.height_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub gravity: f64,
    pub catch_height: f64,
    pub history_size: usize,
    /// Seconds between resampled trajectory points in diagnostics.
    pub trajectory_step: f64,
    /// Seconds without a sighting before a track's history is discarded.
    pub track_timeout: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        let params = TrajectoryParams::default();
        Self {
            gravity: params.gravity,
            catch_height: params.catch_height,
            history_size: params.capacity,
            trajectory_step: 0.05,
            track_timeout: 1.0,
        }
    }
}

impl PhysicsConfig {
    pub fn trajectory_params(&self) -> TrajectoryParams {
        TrajectoryParams {
            gravity: self.gravity,
            catch_height: self.catch_height,
            capacity: self.history_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub relay_url: String,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8000/ws/controller".into(),
            auto_reconnect: true,
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 5_000,
            send_timeout_ms: 250,
        }
    }
}

impl LinkConfig {
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            auto_reconnect: self.auto_reconnect,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub relay_url: String,
    pub serial_port: String,
    pub baud_rate: u32,
    pub reconnect_delay_ms: u64,
    /// Unset retries forever.
    pub max_attempts: Option<u32>,
    /// Delay after opening the port while the board resets.
    pub settle_ms: u64,
    pub stop_on_disconnect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8000/ws/robot".into(),
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            reconnect_delay_ms: 5_000,
            max_attempts: None,
            settle_ms: 2_000,
            stop_on_disconnect: true,
        }
    }
}

impl BridgeConfig {
    pub fn options(&self) -> BridgeOptions {
        BridgeOptions {
            relay_url: self.relay_url.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_attempts,
            stop_on_disconnect: self.stop_on_disconnect,
            ..BridgeOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Address for the HTTP status/metrics server; disabled when unset.
    pub status_bind: Option<String>,
    pub chrome_trace: Option<String>,
    #[serde(skip)]
    pub verbose: bool,
}

impl AppConfig {
    /// Read `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.width <= 0 || camera.height <= 0 {
            bail!("camera.width and camera.height must be positive");
        }
        if !(camera.fps > 0.0) {
            bail!("camera.fps must be positive");
        }
        if camera.failure_threshold == 0 {
            bail!("camera.failure_threshold must be at least 1");
        }
        if self.detector.input_size <= 0 {
            bail!("detector.input_size must be positive");
        }
        if !(self.projection.focal_length > 0.0) {
            bail!("projection.focal_length must be positive");
        }
        if !(self.projection.horizontal_limit > 0.0 && self.projection.height_limit > 0.0) {
            bail!("projection limits must be positive");
        }
        let objects = &self.objects;
        if !(objects.can > 0.0 && objects.paper > 0.0 && objects.fallback > 0.0) {
            bail!("object sizes must be positive");
        }
        let physics = &self.physics;
        if !(physics.gravity > 0.0) {
            bail!("physics.gravity must be positive");
        }
        if physics.history_size < intercept::MIN_FIT_POINTS {
            bail!(
                "physics.history_size must be at least {}",
                intercept::MIN_FIT_POINTS
            );
        }
        if !(physics.trajectory_step >= MIN_TRAJECTORY_STEP) {
            bail!("physics.trajectory_step must be at least {MIN_TRAJECTORY_STEP} s");
        }
        if !(physics.track_timeout > 0.0) {
            bail!("physics.track_timeout must be positive");
        }
        if self.control.min_distance < 0.0 {
            bail!("control.min_distance must not be negative");
        }
        if !(self.control.max_reach > self.control.min_distance) {
            bail!("control.max_reach must be greater than control.min_distance");
        }
        if self.bridge.baud_rate == 0 {
            bail!("bridge.baud_rate must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.physics.history_size, 10);
        assert_eq!(config.objects.can, 0.17);
        assert_eq!(config.link.relay_url, "ws://localhost:8000/ws/controller");
        assert_eq!(config.bridge.max_attempts, None);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[camera]
uri = "synthetic"
fps = 60.0

[objects]
fallback = 0.2

[bridge]
serial_port = "/dev/ttyACM0"
max_attempts = 4
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.camera.uri, "synthetic");
        assert_eq!(config.camera.fps, 60.0);
        assert_eq!(config.camera.failure_threshold, 30);
        assert_eq!(config.objects.fallback, 0.2);
        assert_eq!(config.objects.can, 0.17);
        assert_eq!(config.bridge.serial_port, "/dev/ttyACM0");
        assert_eq!(config.bridge.max_attempts, Some(4));
        assert_eq!(config.bridge.baud_rate, 115_200);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.physics.history_size = 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.control.max_reach = config.control.min_distance;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.physics.gravity = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.physics.trajectory_step = 1e-10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[camera]\nfps = \"fast\"").unwrap();
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config file"));
    }
}
