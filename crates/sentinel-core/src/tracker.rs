//! Kalman-filtered primary-face tracking.
//!
//! Locks onto one face and follows it across frames with a constant-velocity
//! filter over `[cx, cy, w, h, vx, vy]`. Detections that do not overlap the
//! predicted box are ignored — a face that "teleports" (video cut, spurious
//! detection) never captures the lock. The target is dropped only after
//! `max_lost_frames` consecutive misses.

use nalgebra::{SMatrix, SVector};

use crate::types::{iou, FaceDetection};

type Vector6 = SVector<f64, 6>;
type Matrix6 = SMatrix<f64, 6, 6>;
type Vector4 = SVector<f64, 4>;
type Matrix4 = SMatrix<f64, 4, 4>;
type Matrix4x6 = SMatrix<f64, 4, 6>;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Minimum IoU between a detection and the predicted box for
    /// re-association.
    pub iou_reassoc: f32,
    /// Consecutive misses tolerated before the lock is dropped.
    pub max_lost_frames: u32,
    /// Minimum face side length for acquiring a new lock.
    pub min_face_px: f32,
    /// Filter time step (seconds per frame).
    pub dt: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_reassoc: 0.3,
            max_lost_frames: 30,
            min_face_px: 100.0,
            dt: 1.0 / 15.0,
        }
    }
}

/// The tracked primary face after one accepted tick.
#[derive(Debug, Clone)]
pub struct TrackedTarget {
    /// Kalman-smoothed box `(x, y, w, h)`.
    pub smoothed_box: (f32, f32, f32, f32),
    /// The raw detection associated this tick (carries landmarks and score).
    pub detection: FaceDetection,
}

struct TargetFilter {
    state: Vector6,
    covariance: Matrix6,
    transition: Matrix6,
    measurement: Matrix4x6,
    process_noise: Matrix6,
    measurement_noise: Matrix4,
}

impl TargetFilter {
    fn new(det: &FaceDetection, dt: f64) -> Self {
        let (cx, cy) = det.center();

        let mut transition = Matrix6::identity();
        transition[(0, 4)] = dt;
        transition[(1, 5)] = dt;

        let mut measurement = Matrix4x6::zeros();
        for i in 0..4 {
            measurement[(i, i)] = 1.0;
        }

        let mut state = Vector6::zeros();
        state[0] = f64::from(cx);
        state[1] = f64::from(cy);
        state[2] = f64::from(det.width);
        state[3] = f64::from(det.height);

        Self {
            state,
            covariance: Matrix6::identity() * 1000.0,
            transition,
            measurement,
            process_noise: Matrix6::identity() * 0.03,
            measurement_noise: Matrix4::identity() * 0.1,
        }
    }

    fn predict(&mut self) {
        self.state = self.transition * self.state;
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;
    }

    fn update(&mut self, det: &FaceDetection) {
        let (cx, cy) = det.center();
        let measurement = Vector4::new(
            f64::from(cx),
            f64::from(cy),
            f64::from(det.width),
            f64::from(det.height),
        );

        let innovation = measurement - self.measurement * self.state;
        let innovation_cov =
            self.measurement * self.covariance * self.measurement.transpose() + self.measurement_noise;

        let Some(inv) = innovation_cov.try_inverse() else {
            // Degenerate covariance: keep the prediction
            return;
        };
        let gain = self.covariance * self.measurement.transpose() * inv;

        self.state += gain * innovation;
        self.covariance = (Matrix6::identity() - gain * self.measurement) * self.covariance;
    }

    /// Current state as an `(x, y, w, h)` box.
    fn as_box(&self) -> (f32, f32, f32, f32) {
        let cx = self.state[0] as f32;
        let cy = self.state[1] as f32;
        let w = (self.state[2] as f32).max(1.0);
        let h = (self.state[3] as f32).max(1.0);
        (cx - w / 2.0, cy - h / 2.0, w, h)
    }

    fn speed(&self) -> f64 {
        (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt()
    }
}

/// Primary-face stability tracker. At most one target is locked at a time.
pub struct StabilityTracker {
    config: TrackerConfig,
    filter: Option<TargetFilter>,
    lost_frames: u32,
}

impl StabilityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            filter: None,
            lost_frames: 0,
        }
    }

    pub fn reset(&mut self) {
        self.filter = None;
        self.lost_frames = 0;
    }

    pub fn is_locked(&self) -> bool {
        self.filter.is_some()
    }

    pub fn lost_frames(&self) -> u32 {
        self.lost_frames
    }

    /// Low filter velocity means the subject is holding still enough for a
    /// clean capture.
    pub fn is_stable(&self, velocity_threshold: f64) -> bool {
        self.filter
            .as_ref()
            .map(|f| f.speed() < velocity_threshold)
            .unwrap_or(false)
    }

    /// Advance one tick with the current frame's detections.
    ///
    /// Returns the tracked target when a detection was associated this tick;
    /// `None` while unlocked or while the locked target is momentarily lost.
    pub fn update(&mut self, detections: &[FaceDetection]) -> Option<TrackedTarget> {
        match self.filter.as_mut() {
            None => {
                let min_side = self.config.min_face_px;
                let candidate = detections
                    .iter()
                    .filter(|d| d.width.min(d.height) >= min_side)
                    .max_by(|a, b| {
                        a.area()
                            .partial_cmp(&b.area())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })?;

                self.filter = Some(TargetFilter::new(candidate, self.config.dt));
                self.lost_frames = 0;
                Some(TrackedTarget {
                    smoothed_box: (candidate.x, candidate.y, candidate.width, candidate.height),
                    detection: candidate.clone(),
                })
            }
            Some(filter) => {
                filter.predict();
                let predicted = filter.as_box();

                let best = detections
                    .iter()
                    .map(|d| (iou(predicted, (d.x, d.y, d.width, d.height)), d))
                    .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

                match best {
                    Some((overlap, det)) if overlap >= self.config.iou_reassoc => {
                        filter.update(det);
                        self.lost_frames = 0;
                        Some(TrackedTarget {
                            smoothed_box: filter.as_box(),
                            detection: det.clone(),
                        })
                    }
                    _ => {
                        self.lost_frames += 1;
                        if self.lost_frames > self.config.max_lost_frames {
                            tracing::debug!(
                                lost = self.lost_frames,
                                "target lost; dropping lock"
                            );
                            self.reset();
                        }
                        None
                    }
                }
            }
        }
    }
}
