//! One detect-to-command step of the control loop, free of I/O.

use intercept::{
    CommandGenerator, LandingPrediction, ObjectSizes, ProjectionBounds, SpatialProjector, TrackKey,
    TrackRegistry, VelocityCommand,
};
use ml_core::{Detection, select_target};
use tracing::debug;

use crate::config::AppConfig;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CycleOutcome {
    NoTarget,
    /// The target projected outside the plausible envelope.
    Rejected,
    /// Position recorded but no landing could be predicted yet.
    Tracking { samples: usize },
    Command {
        command: VelocityCommand,
        landing: LandingPrediction,
    },
}

pub(crate) struct ControlCycle {
    focal_length: f64,
    bounds: ProjectionBounds,
    projector: Option<((i32, i32), SpatialProjector)>,
    sizes: ObjectSizes,
    registry: TrackRegistry,
    generator: CommandGenerator,
    min_confidence: f32,
    target_classes: Vec<i64>,
    locked_track: Option<i64>,
    track_timeout: f64,
    trajectory_step: f64,
    verbose: bool,
}

impl ControlCycle {
    pub(crate) fn new(config: &AppConfig) -> Self {
        Self {
            focal_length: config.projection.focal_length,
            bounds: config.projection.bounds(),
            projector: None,
            sizes: config.objects,
            registry: TrackRegistry::new(config.physics.trajectory_params()),
            generator: config.control,
            min_confidence: config.detector.confidence,
            target_classes: config.detector.target_classes.clone(),
            locked_track: None,
            track_timeout: config.physics.track_timeout,
            trajectory_step: config.physics.trajectory_step,
            verbose: config.telemetry.verbose,
        }
    }

    /// Projector for the current frame geometry; rebuilt if the frame size changes.
    fn projector(&mut self, frame_size: (i32, i32)) -> SpatialProjector {
        match self.projector {
            Some((size, projector)) if size == frame_size => projector,
            _ => {
                let projector =
                    SpatialProjector::new(self.focal_length, frame_size.0, frame_size.1, self.bounds);
                self.projector = Some((frame_size, projector));
                projector
            }
        }
    }

    pub(crate) fn step(
        &mut self,
        frame_size: (i32, i32),
        timestamp: f64,
        detections: &[Detection],
    ) -> CycleOutcome {
        let pruned = self.registry.prune(timestamp, self.track_timeout);
        if pruned > 0 {
            debug!("dropped {pruned} stale track(s)");
            if let Some(track) = self.locked_track {
                if self.registry.get(TrackKey::Id(track)).is_none() {
                    self.locked_track = None;
                }
            }
        }

        let confident: Vec<Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .cloned()
            .collect();
        let Some(target) = select_target(&confident, self.locked_track, &self.target_classes) else {
            return CycleOutcome::NoTarget;
        };
        if target.track_id.is_some() {
            self.locked_track = target.track_id;
        }

        let real_width = self.sizes.width_for_id(target.class_id);
        let projector = self.projector(frame_size);
        let Some(position) = projector.locate(&target.bbox, real_width, timestamp) else {
            metrics::counter!("intercept_positions_rejected_total").increment(1);
            debug!("implausible position for class {} rejected", target.class_id);
            return CycleOutcome::Rejected;
        };

        let estimator = self.registry.observe(TrackKey::from(target.track_id), position);
        let Some(landing) = estimator.predict_landing() else {
            metrics::counter!("intercept_prediction_miss_total").increment(1);
            debug!("no landing prediction ({} samples)", estimator.len());
            return CycleOutcome::Tracking {
                samples: estimator.len(),
            };
        };

        metrics::counter!("intercept_predictions_total").increment(1);
        if self.verbose {
            let path = estimator.predict_trajectory(self.trajectory_step);
            debug!(
                "landing at ({:.3}, {:.3}) in {:.3}s, {} trajectory points",
                landing.x,
                landing.y,
                landing.time_to_impact,
                path.len()
            );
        }

        CycleOutcome::Command {
            command: self.generator.command_for(landing.x, landing.y),
            landing,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ml_core::BoundingBox;

    use super::*;

    const FRAME: (i32, i32) = (640, 480);

    /// A can (0.17 m) seen at height `z`, `x` meters right of the optical axis.
    fn can_at(x: f64, z: f64, track_id: Option<i64>) -> Detection {
        let width = 1000.0 * 0.17 / z;
        let u = 320.0 + x * 1000.0 / z;
        Detection {
            bbox: BoundingBox::from_center_xywh([u as f32, 240.0, width as f32, 40.0]),
            class_id: 0,
            confidence: 0.9,
            track_id,
        }
    }

    #[test]
    fn falling_object_produces_a_command_toward_its_landing_point() {
        let mut cycle = ControlCycle::new(&AppConfig::default());

        assert_eq!(
            cycle.step(FRAME, 100.0, &[can_at(0.3, 2.0, Some(4))]),
            CycleOutcome::Tracking { samples: 1 }
        );
        assert_eq!(
            cycle.step(FRAME, 100.1, &[can_at(0.3, 1.5, Some(4))]),
            CycleOutcome::Tracking { samples: 2 }
        );
        let CycleOutcome::Command { command, landing } =
            cycle.step(FRAME, 100.2, &[can_at(0.3, 1.0, Some(4))])
        else {
            panic!("expected a command on the third sample");
        };

        assert_abs_diff_eq!(landing.x, 0.3, epsilon = 1e-3);
        assert_abs_diff_eq!(landing.y, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(command.vx, 0.15, epsilon = 1e-3);
        assert_abs_diff_eq!(command.vy, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn nothing_to_do_without_confident_detections() {
        let mut cycle = ControlCycle::new(&AppConfig::default());
        assert_eq!(cycle.step(FRAME, 1.0, &[]), CycleOutcome::NoTarget);

        let mut faint = can_at(0.0, 1.0, None);
        faint.confidence = 0.05;
        assert_eq!(cycle.step(FRAME, 1.1, &[faint]), CycleOutcome::NoTarget);
    }

    #[test]
    fn implausible_positions_never_enter_history() {
        let mut cycle = ControlCycle::new(&AppConfig::default());
        // 10 px wide can: 17 m away, far beyond the height limit.
        let mut far = can_at(0.0, 1.0, Some(1));
        far.bbox = BoundingBox::from_center_xywh([320.0, 240.0, 10.0, 10.0]);
        assert_eq!(cycle.step(FRAME, 1.0, &[far]), CycleOutcome::Rejected);
        assert_eq!(
            cycle.step(FRAME, 1.1, &[can_at(0.0, 1.0, Some(1))]),
            CycleOutcome::Tracking { samples: 1 }
        );
    }

    #[test]
    fn stale_tracks_start_over() {
        let mut cycle = ControlCycle::new(&AppConfig::default());
        cycle.step(FRAME, 10.0, &[can_at(0.0, 2.0, None)]);
        cycle.step(FRAME, 10.1, &[can_at(0.0, 1.9, None)]);
        assert_eq!(
            cycle.step(FRAME, 15.0, &[can_at(0.0, 1.8, None)]),
            CycleOutcome::Tracking { samples: 1 }
        );
    }
}
