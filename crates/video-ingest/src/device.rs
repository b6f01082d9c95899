//! Capture device seam used by [`FrameSource`](crate::FrameSource).

use chrono::Utc;

use crate::types::{CaptureError, Frame, FrameFormat};

/// A blocking source of frames owned by the acquisition thread.
///
/// `Ok(None)` reports a missed frame (the device answered but produced no
/// image); it counts towards the consecutive-failure threshold just like an
/// error does.
pub trait CaptureDevice: Send + 'static {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying handle. Called exactly once, after the
    /// acquisition thread has been joined.
    fn release(&mut self) {}

    fn describe(&self) -> String;
}

impl CaptureDevice for Box<dyn CaptureDevice> {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Emits black frames of a fixed size. Used for dry runs of the control
/// pipeline together with a replay detector.
pub struct SyntheticCamera {
    width: i32,
    height: i32,
}

impl SyntheticCamera {
    pub fn new(size: (i32, i32)) -> Self {
        Self {
            width: size.0,
            height: size.1,
        }
    }
}

impl CaptureDevice for SyntheticCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let format = FrameFormat::Bgr8;
        let len = (self.width.max(0) as usize) * (self.height.max(0) as usize);
        Ok(Some(Frame {
            data: vec![0; len * format.bytes_per_pixel()],
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format,
        }))
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}
