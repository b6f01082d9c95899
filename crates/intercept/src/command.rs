//! Proportional planar velocity toward a predicted landing point.

use serde::{Deserialize, Serialize};

/// Normalized base velocity in robot-local axes: `vy` forward/back, `vx` lateral.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityCommand {
    pub vy: f64,
    pub vx: f64,
}

impl VelocityCommand {
    pub const STOP: Self = Self { vy: 0.0, vx: 0.0 };

    /// Clamps both components to `[-1, 1]`; non-finite input becomes zero.
    pub fn new(vy: f64, vx: f64) -> Self {
        Self {
            vy: clamp_unit(vy),
            vx: clamp_unit(vx),
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.vy.hypot(self.vx)
    }

    pub fn is_stop(&self) -> bool {
        self.vy == 0.0 && self.vx == 0.0
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandGenerator {
    /// Below this planar distance (meters) the base holds still.
    pub min_distance: f64,
    /// Distance at which the commanded speed saturates at 1.0.
    pub max_reach: f64,
}

impl Default for CommandGenerator {
    fn default() -> Self {
        Self {
            min_distance: 0.1,
            max_reach: 2.0,
        }
    }
}

impl CommandGenerator {
    pub fn new(min_distance: f64, max_reach: f64) -> Self {
        Self {
            min_distance,
            max_reach,
        }
    }

    pub fn command_for(&self, x: f64, y: f64) -> VelocityCommand {
        let distance = x.hypot(y);
        if !(distance >= self.min_distance) || distance == 0.0 {
            return VelocityCommand::STOP;
        }
        let speed = if self.max_reach > 0.0 {
            (distance / self.max_reach).min(1.0)
        } else {
            1.0
        };
        VelocityCommand::new(y / distance * speed, x / distance * speed)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn stops_exactly_inside_min_distance() {
        let generator = CommandGenerator::new(0.1, 2.0);
        assert!(generator.command_for(0.0, 0.0).is_stop());
        assert!(generator.command_for(0.05, -0.08).is_stop());
        assert!(!generator.command_for(0.1, 0.0).is_stop());
        assert!(!generator.command_for(0.0, -0.3).is_stop());
    }

    #[test]
    fn speed_scales_then_saturates() {
        let generator = CommandGenerator::new(0.1, 2.0);
        let mut previous = 0.0;
        for step in 1..=40 {
            let d = f64::from(step) * 0.1;
            let magnitude = generator.command_for(d * 0.6, d * 0.8).magnitude();
            assert!(magnitude + 1e-12 >= previous, "distance {d}");
            assert!(magnitude <= 1.0 + 1e-12);
            previous = magnitude;
        }
        assert_relative_eq!(generator.command_for(1.0, 0.0).magnitude(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(generator.command_for(30.0, 40.0).magnitude(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn axes_map_to_robot_frame() {
        let generator = CommandGenerator::new(0.1, 1.0);
        let forward = generator.command_for(0.0, 2.0);
        assert_relative_eq!(forward.vy, 1.0);
        assert_relative_eq!(forward.vx, 0.0);

        let left = generator.command_for(-0.5, 0.0);
        assert_relative_eq!(left.vx, -0.5);
        assert_relative_eq!(left.vy, 0.0);
    }

    #[test]
    fn components_are_clamped() {
        let command = VelocityCommand::new(3.0, f64::NAN);
        assert_eq!(command, VelocityCommand::new(1.0, 0.0));
        assert_eq!(VelocityCommand::new(-7.5, -0.25).vy, -1.0);
    }
}
