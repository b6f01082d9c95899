//! Bounded motion history and the ballistic landing solver.
//!
//! Velocity is refit from scratch on every call by per-axis least squares,
//! with time measured relative to the newest sample. The vertical axis is then
//! solved against `z(t) = z0 + vz*t - g*t^2/2` for the catch height.

use std::collections::{HashMap, VecDeque};

use nalgebra::Vector3;

use crate::projector::Position3D;

/// Minimum samples before a velocity fit is attempted.
pub const MIN_FIT_POINTS: usize = 3;

/// Upper bound on sampled points in [`TrajectoryEstimator::predict_trajectory`],
/// excluding the landing point; finer steps are widened to fit.
pub const MAX_TRAJECTORY_POINTS: usize = 1024;

const TIME_VARIANCE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryParams {
    pub gravity: f64,
    pub catch_height: f64,
    pub capacity: usize,
}

impl Default for TrajectoryParams {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            catch_height: 0.0,
            capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandingPrediction {
    pub x: f64,
    pub y: f64,
    /// Always the configured catch height.
    pub z: f64,
    /// Seconds from the newest sample until the crossing.
    pub time_to_impact: f64,
}

/// Fixed-capacity, insertion-ordered position history.
#[derive(Debug, Clone)]
pub struct MotionHistory {
    points: VecDeque<Position3D>,
    capacity: usize,
}

impl MotionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, position: Position3D) {
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(position);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Position3D> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position3D> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryEstimator {
    history: MotionHistory,
    gravity: f64,
    catch_height: f64,
}

impl TrajectoryEstimator {
    pub fn new(params: TrajectoryParams) -> Self {
        Self {
            history: MotionHistory::new(params.capacity),
            gravity: params.gravity,
            catch_height: params.catch_height,
        }
    }

    /// Append a sample stamped `timestamp`, evicting the oldest beyond capacity.
    pub fn add_point(&mut self, position: Position3D, timestamp: f64) {
        self.history.push(Position3D { timestamp, ..position });
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> &MotionHistory {
        &self.history
    }

    /// Least-squares velocity per axis, `None` below [`MIN_FIT_POINTS`] or when
    /// every sample shares one timestamp.
    pub fn velocity(&self) -> Option<Vector3<f64>> {
        let n = self.history.len();
        if n < MIN_FIT_POINTS {
            return None;
        }
        let t_ref = self.history.latest()?.timestamp;

        let count = n as f64;
        let mean_t = self.history.iter().map(|p| p.timestamp - t_ref).sum::<f64>() / count;
        let mean_p = self.history.iter().map(Position3D::vector).sum::<Vector3<f64>>() / count;

        let mut var_t = 0.0;
        let mut cov = Vector3::zeros();
        for p in self.history.iter() {
            let dt = p.timestamp - t_ref - mean_t;
            var_t += dt * dt;
            cov += (p.vector() - mean_p) * dt;
        }

        if var_t < TIME_VARIANCE_EPSILON {
            return None;
        }
        Some(cov / var_t)
    }

    /// Time for the newest sample to reach the catch height, plus the fitted velocity.
    fn solve(&self) -> Option<(Position3D, Vector3<f64>, f64)> {
        if self.gravity <= 0.0 {
            return None;
        }
        let velocity = self.velocity()?;
        let origin = *self.history.latest()?;

        let a = -0.5 * self.gravity;
        let b = velocity.z;
        let c = origin.z - self.catch_height;

        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 {
            return None;
        }
        let root = discriminant.sqrt();
        let t1 = (-b + root) / (2.0 * a);
        let t2 = (-b - root) / (2.0 * a);
        let t = t1.max(t2);
        if !(t > 0.0) {
            return None;
        }
        Some((origin, velocity, t))
    }

    pub fn predict_landing(&self) -> Option<LandingPrediction> {
        let (origin, velocity, t) = self.solve()?;
        Some(LandingPrediction {
            x: origin.x + velocity.x * t,
            y: origin.y + velocity.y * t,
            z: self.catch_height,
            time_to_impact: t,
        })
    }

    /// Positions sampled every `step` seconds from the newest sample up to
    /// impact, ending exactly at the landing point. Empty when no landing exists.
    pub fn predict_trajectory(&self, step: f64) -> Vec<Position3D> {
        if !(step > 0.0) {
            return Vec::new();
        }
        let Some((origin, velocity, impact)) = self.solve() else {
            return Vec::new();
        };

        let at = |t: f64| Position3D {
            x: origin.x + velocity.x * t,
            y: origin.y + velocity.y * t,
            z: origin.z + velocity.z * t - 0.5 * self.gravity * t * t,
            timestamp: origin.timestamp + t,
        };

        let step = step.max(impact / MAX_TRAJECTORY_POINTS as f64);
        let mut points = Vec::with_capacity(((impact / step) as usize).min(MAX_TRAJECTORY_POINTS) + 1);
        for i in 0..MAX_TRAJECTORY_POINTS {
            let t = i as f64 * step;
            if t >= impact {
                break;
            }
            points.push(at(t));
        }
        points.push(Position3D {
            z: self.catch_height,
            ..at(impact)
        });
        points
    }
}

/// Identity a history is filed under; detections without a tracker id share one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKey {
    Untracked,
    Id(i64),
}

impl From<Option<i64>> for TrackKey {
    fn from(track_id: Option<i64>) -> Self {
        track_id.map_or(Self::Untracked, Self::Id)
    }
}

/// Per-track estimators, created on first sighting and pruned once stale.
#[derive(Debug, Clone)]
pub struct TrackRegistry {
    params: TrajectoryParams,
    tracks: HashMap<TrackKey, TrajectoryEstimator>,
}

impl TrackRegistry {
    pub fn new(params: TrajectoryParams) -> Self {
        Self {
            params,
            tracks: HashMap::new(),
        }
    }

    pub fn estimator_mut(&mut self, key: TrackKey) -> &mut TrajectoryEstimator {
        let params = self.params;
        self.tracks
            .entry(key)
            .or_insert_with(|| TrajectoryEstimator::new(params))
    }

    /// Record a position for `key` and return its updated estimator.
    pub fn observe(&mut self, key: TrackKey, position: Position3D) -> &TrajectoryEstimator {
        let estimator = self.estimator_mut(key);
        estimator.add_point(position, position.timestamp);
        estimator
    }

    pub fn get(&self, key: TrackKey) -> Option<&TrajectoryEstimator> {
        self.tracks.get(&key)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop tracks whose newest sample is more than `max_age` seconds before `now`.
    pub fn prune(&mut self, now: f64, max_age: f64) -> usize {
        let before = self.tracks.len();
        self.tracks.retain(|_, estimator| {
            estimator
                .history()
                .latest()
                .is_some_and(|p| now - p.timestamp <= max_age)
        });
        before - self.tracks.len()
    }
}
