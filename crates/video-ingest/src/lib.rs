//! Frame acquisition for the catcher controller.

#[cfg(feature = "with-opencv")]
mod camera;
mod device;
mod source;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvCamera;
pub use device::{CaptureDevice, SyntheticCamera};
pub use source::{CaptureOptions, DEFAULT_FAILURE_THRESHOLD, FrameSource, SourceStatus};
pub use types::{CaptureError, Frame, FrameFormat};

/// URI accepted in place of a camera to run on blank synthetic frames.
pub const SYNTHETIC_URI: &str = "synthetic";

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}
