//! OpenCV-backed camera device.

use anyhow::anyhow;
use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual, Rect},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    device::CaptureDevice,
    parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Camera opened through OpenCV's `videoio`, producing square BGR frames.
pub struct OpenCvCamera {
    uri: String,
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    size: i32,
}

impl OpenCvCamera {
    /// Open `uri`, request `capture_size` at `fps`, and emit `side`x`side` frames.
    ///
    /// The first `warmup_frames` reads are discarded so auto exposure can
    /// settle before frames reach the detector.
    pub fn open(
        uri: &str,
        capture_size: (i32, i32),
        side: i32,
        fps: f64,
        warmup_frames: u32,
    ) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(uri)?;
        configure_camera(&mut cap, capture_size, fps);

        let mut frame = Mat::default();
        for _ in 0..warmup_frames {
            let _ = cap.read(&mut frame);
        }
        debug!("camera {uri} warmed up after {warmup_frames} reads");

        Ok(Self {
            uri: uri.to_string(),
            cap,
            frame,
            scratch: Mat::default(),
            size: side,
        })
    }
}

impl CaptureDevice for OpenCvCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = self.frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        // Center crop to a square before scaling.
        let side = size.width.min(size.height);
        let crop = Rect::new((size.width - side) / 2, (size.height - side) / 2, side, side);
        let square = Mat::roi(&self.frame, crop).map_err(|e| CaptureError::Other(e.into()))?;
        opencv::imgproc::resize(
            &square,
            &mut self.scratch,
            core::Size {
                width: self.size,
                height: self.size,
            },
            0.0,
            0.0,
            opencv::imgproc::INTER_LINEAR,
        )
        .map_err(|e| CaptureError::Other(e.into()))?;

        let data = self
            .scratch
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        if data.is_empty() {
            return Err(CaptureError::Other(anyhow!("empty frame buffer from {}", self.uri)));
        }

        Ok(Some(Frame {
            data,
            width: self.size,
            height: self.size,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        }))
    }

    fn release(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("failed to release camera {}: {err}", self.uri);
        }
    }

    fn describe(&self) -> String {
        format!("opencv {}", self.uri)
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}
