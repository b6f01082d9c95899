//! Detection types and the detector seam consumed by the control cycle.
//!
//! The object detector itself is an external collaborator: anything that can
//! turn a [`Frame`] into a list of [`Detection`]s plugs in through [`Detector`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use video_ingest::Frame;

#[cfg(feature = "with-tch")]
pub mod detector;
pub mod replay;

#[cfg(feature = "with-tch")]
pub use tch;

/// Axis-aligned box in pixel coordinates, corners `(x1, y1)` to `(x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a center-based `[cx, cy, w, h]` box as emitted by YOLO heads.
    pub fn from_center_xywh(xywh: [f32; 4]) -> Self {
        let [cx, cy, w, h] = xywh;
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// Single detection returned by a detector for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: i64,
    pub confidence: f32,
    #[serde(default)]
    pub track_id: Option<i64>,
}

/// Synchronous per-frame inference.
pub trait Detector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

impl<T: Detector + ?Sized> Detector for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

/// Choose the single object the controller acts on.
///
/// The detection carrying `locked_track` wins while it is still visible;
/// otherwise the most confident detection among `allowed_classes` (all
/// classes when the list is empty).
pub fn select_target<'a>(
    detections: &'a [Detection],
    locked_track: Option<i64>,
    allowed_classes: &[i64],
) -> Option<&'a Detection> {
    let eligible = detections
        .iter()
        .filter(|d| allowed_classes.is_empty() || allowed_classes.contains(&d.class_id));

    if let Some(track) = locked_track {
        if let Some(found) = eligible.clone().find(|d| d.track_id == Some(track)) {
            return Some(found);
        }
    }

    eligible.max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}
