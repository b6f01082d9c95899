use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
///
/// Frames are never mutated after they are published; readers always get
/// their own copy of the pixel buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Monotonic counter assigned by the frame source.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    /// Capture time in seconds, the unit used by the trajectory estimator.
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("capture device failed {count} consecutive reads")]
    ConsecutiveFailures { count: u32 },
    #[error("capture device already released")]
    Released,
    #[error(transparent)]
    Other(#[from] Error),
}
