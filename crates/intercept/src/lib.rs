//! Geometry and physics for turning detections into base velocity commands.
//!
//! [`SpatialProjector`] lifts a box into meters, [`TrajectoryEstimator`] fits
//! the recent motion and solves for the landing point, and
//! [`CommandGenerator`] turns that point into a [`VelocityCommand`].

mod command;
mod objects;
mod projector;
mod trajectory;

pub use command::{CommandGenerator, VelocityCommand};
pub use objects::{ObjectClass, ObjectSizes};
pub use projector::{MIN_BOX_WIDTH_PX, Position3D, ProjectionBounds, SpatialProjector};
pub use trajectory::{
    LandingPrediction, MAX_TRAJECTORY_POINTS, MIN_FIT_POINTS, MotionHistory, TrackKey, TrackRegistry, TrajectoryEstimator,
    TrajectoryParams,
};
