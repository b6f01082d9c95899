//! Pinhole back-projection of detection boxes into camera-frame meters.
//!
//! The camera looks straight up, so depth doubles as height above the lens.

use ml_core::BoundingBox;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Boxes narrower than this many pixels cannot be projected.
pub const MIN_BOX_WIDTH_PX: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Seconds, same clock as the frame timestamps.
    pub timestamp: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self { x, y, z, timestamp }
    }

    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// Physical envelope a projected position must fall inside to be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionBounds {
    /// Max absolute lateral offset on either axis, meters.
    pub horizontal_limit: f64,
    /// Max depth (height above the camera), meters.
    pub height_limit: f64,
}

impl Default for ProjectionBounds {
    fn default() -> Self {
        Self {
            horizontal_limit: 5.0,
            height_limit: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialProjector {
    focal_length: f64,
    cx: f64,
    cy: f64,
    bounds: ProjectionBounds,
}

impl SpatialProjector {
    /// The principal point sits at the integer image center.
    pub fn new(focal_length: f64, image_width: i32, image_height: i32, bounds: ProjectionBounds) -> Self {
        Self {
            focal_length,
            cx: f64::from(image_width / 2),
            cy: f64::from(image_height / 2),
            bounds,
        }
    }

    pub fn focal_length(&self) -> f64 {
        self.focal_length
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.cx, self.cy)
    }

    /// Similar-triangles depth from a known real width, then back-project the box center.
    ///
    /// Returns `None` when the box is narrower than [`MIN_BOX_WIDTH_PX`].
    pub fn project(&self, bbox: &BoundingBox, real_width: f64, timestamp: f64) -> Option<Position3D> {
        let pixel_width = bbox.width();
        if !(pixel_width >= MIN_BOX_WIDTH_PX) {
            return None;
        }

        let z = self.focal_length * real_width / f64::from(pixel_width);
        let (u, v) = bbox.center();
        let x = (f64::from(u) - self.cx) * z / self.focal_length;
        let y = (f64::from(v) - self.cy) * z / self.focal_length;
        Some(Position3D { x, y, z, timestamp })
    }

    pub fn is_plausible(&self, position: &Position3D) -> bool {
        let b = &self.bounds;
        position.x.is_finite()
            && position.y.is_finite()
            && position.x.abs() <= b.horizontal_limit
            && position.y.abs() <= b.horizontal_limit
            && position.z > 0.0
            && position.z <= b.height_limit
    }

    /// Project and keep the result only if it passes [`Self::is_plausible`].
    pub fn locate(&self, bbox: &BoundingBox, real_width: f64, timestamp: f64) -> Option<Position3D> {
        self.project(bbox, real_width, timestamp)
            .filter(|position| self.is_plausible(position))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn projector() -> SpatialProjector {
        SpatialProjector::new(1000.0, 640, 480, ProjectionBounds::default())
    }

    #[test]
    fn depth_follows_similar_triangles() {
        let bbox = BoundingBox::new(300.0, 220.0, 400.0, 260.0);
        let p = projector().project(&bbox, 0.17, 2.5).unwrap();
        assert_relative_eq!(p.z, 1.7, epsilon = 1e-9);
        assert_relative_eq!(p.x, 30.0 * 1.7 / 1000.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-9);
        assert_eq!(p.timestamp, 2.5);
    }

    #[test]
    fn positive_depth_for_any_box_at_least_one_pixel_wide() {
        let projector = projector();
        for width in [1.0_f32, 1.5, 7.0, 320.0, 2000.0] {
            let bbox = BoundingBox::new(10.0, 10.0, 10.0 + width, 20.0);
            let p = projector.project(&bbox, 0.1, 0.0).unwrap();
            assert!(p.z > 0.0, "width {width} gave z={}", p.z);
        }
    }

    #[test]
    fn sub_pixel_and_degenerate_boxes_are_invalid() {
        let projector = projector();
        for width in [0.99_f32, 0.0, -4.0] {
            let bbox = BoundingBox::new(100.0, 100.0, 100.0 + width, 110.0);
            assert!(projector.project(&bbox, 0.1, 0.0).is_none());
        }
        let nan = BoundingBox::new(f32::NAN, 0.0, 5.0, 5.0);
        assert!(projector.project(&nan, 0.1, 0.0).is_none());
    }

    #[test]
    fn locate_rejects_out_of_bounds_positions() {
        let projector = projector();
        // 20 px wide can: z = 1000 * 0.17 / 20 = 8.5 m, above the 3 m ceiling.
        let far = BoundingBox::new(310.0, 230.0, 330.0, 250.0);
        assert!(projector.project(&far, 0.17, 0.0).is_some());
        assert!(projector.locate(&far, 0.17, 0.0).is_none());

        let near = BoundingBox::new(270.0, 190.0, 370.0, 290.0);
        assert!(projector.locate(&near, 0.17, 0.0).is_some());
    }
}
