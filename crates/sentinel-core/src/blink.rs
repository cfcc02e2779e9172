//! Blink detection over the facial mesh.
//!
//! Tracks each eye with its own eye-aspect-ratio state machine
//! (`OPEN → CLOSING → CLOSED → OPENING → OPEN`). A blink is registered
//! only when both eyes complete the full cycle fast enough and close to
//! simultaneously — a one-eyed "blink" is a winking photo cutout, not a
//! blink.

use std::time::{Duration, Instant};

use crate::mesh::MeshLandmark;

/// Mesh indices for the eye contour triplets (p0..p5 per eye).
const LEFT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];
const RIGHT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];

#[derive(Debug, Clone, Copy)]
pub struct BlinkConfig {
    /// EAR at or above which an eye counts as open.
    pub ear_open: f32,
    /// EAR at or below which an eye counts as closed.
    pub ear_closed: f32,
    /// Longest close-to-open cycle that still counts as a blink.
    pub max_blink_duration: Duration,
    /// Both eyes must complete their cycle within this window of each other.
    pub sync_window: Duration,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            ear_open: 0.24,
            ear_closed: 0.19,
            max_blink_duration: Duration::from_millis(800),
            sync_window: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EyeState {
    Open,
    Closing,
    Closed,
    Opening,
}

#[derive(Debug)]
struct EyeMachine {
    state: EyeState,
    closing_started: Option<Instant>,
    /// Completion time of the last full cycle, cleared once consumed.
    completed_at: Option<Instant>,
}

impl EyeMachine {
    fn new() -> Self {
        Self {
            state: EyeState::Open,
            closing_started: None,
            completed_at: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn update(&mut self, ear: f32, now: Instant, config: &BlinkConfig) {
        match self.state {
            EyeState::Open => {
                if ear < config.ear_open {
                    self.state = EyeState::Closing;
                    self.closing_started = Some(now);
                }
            }
            EyeState::Closing => {
                if ear <= config.ear_closed {
                    self.state = EyeState::Closed;
                } else if ear >= config.ear_open {
                    // Aborted half-blink
                    self.state = EyeState::Open;
                    self.closing_started = None;
                }
            }
            EyeState::Closed => {
                if ear > config.ear_closed {
                    self.state = EyeState::Opening;
                }
            }
            EyeState::Opening => {
                if ear >= config.ear_open {
                    self.state = EyeState::Open;
                    if let Some(start) = self.closing_started.take() {
                        if now.duration_since(start) <= config.max_blink_duration {
                            self.completed_at = Some(now);
                        }
                    }
                } else if ear <= config.ear_closed {
                    self.state = EyeState::Closed;
                }
            }
        }
    }
}

/// Blink detector state across frames.
#[derive(Debug)]
pub struct BlinkDetector {
    config: BlinkConfig,
    left: EyeMachine,
    right: EyeMachine,
    blink_count: u32,
}

impl BlinkDetector {
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            config,
            left: EyeMachine::new(),
            right: EyeMachine::new(),
            blink_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.blink_count = 0;
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    /// Feed one mesh observation. Returns true when a blink is registered
    /// on this update.
    pub fn update(&mut self, mesh: &[MeshLandmark]) -> bool {
        let Some((left_ear, right_ear)) = ear_pair(mesh) else {
            return false;
        };
        self.update_ears(left_ear, right_ear, Instant::now())
    }

    /// Mean EAR across both eyes for the given mesh, if computable.
    pub fn mean_ear(mesh: &[MeshLandmark]) -> Option<f32> {
        ear_pair(mesh).map(|(l, r)| (l + r) / 2.0)
    }

    fn update_ears(&mut self, left_ear: f32, right_ear: f32, now: Instant) -> bool {
        self.left.update(left_ear, now, &self.config);
        self.right.update(right_ear, now, &self.config);

        let (Some(l_done), Some(r_done)) = (self.left.completed_at, self.right.completed_at)
        else {
            return false;
        };

        let skew = if l_done > r_done {
            l_done.duration_since(r_done)
        } else {
            r_done.duration_since(l_done)
        };

        if skew <= self.config.sync_window {
            self.left.completed_at = None;
            self.right.completed_at = None;
            self.blink_count += 1;
            true
        } else {
            // Stale unilateral completion: drop the older one
            if l_done < r_done {
                self.left.completed_at = None;
            } else {
                self.right.completed_at = None;
            }
            false
        }
    }
}

/// Eye aspect ratio over a 6-point contour:
/// `(‖p1−p5‖ + ‖p2−p4‖) / (2‖p0−p3‖)`.
fn eye_aspect_ratio(mesh: &[MeshLandmark], indices: &[usize; 6]) -> Option<f32> {
    let p: Vec<(f32, f32)> = indices
        .iter()
        .map(|&i| mesh.get(i).map(|lm| (lm.x, lm.y)))
        .collect::<Option<Vec<_>>>()?;

    let d = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let horizontal = d(p[0], p[3]);
    if horizontal < f32::EPSILON {
        return None;
    }
    Some((d(p[1], p[5]) + d(p[2], p[4])) / (2.0 * horizontal))
}

fn ear_pair(mesh: &[MeshLandmark]) -> Option<(f32, f32)> {
    Some((
        eye_aspect_ratio(mesh, &LEFT_EYE)?,
        eye_aspect_ratio(mesh, &RIGHT_EYE)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BlinkConfig {
        BlinkConfig::default()
    }

    fn detector() -> BlinkDetector {
        BlinkDetector::new(cfg())
    }

    const OPEN: f32 = 0.30;
    const MID: f32 = 0.21;
    const SHUT: f32 = 0.10;

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn test_full_synchronized_blink() {
        let mut det = detector();
        let t0 = Instant::now();

        assert!(!det.update_ears(OPEN, OPEN, at(t0, 0)));
        assert!(!det.update_ears(MID, MID, at(t0, 50)));
        assert!(!det.update_ears(SHUT, SHUT, at(t0, 100)));
        assert!(!det.update_ears(MID, MID, at(t0, 150)));
        let registered = det.update_ears(OPEN, OPEN, at(t0, 200));
        assert!(registered);
        assert_eq!(det.blink_count(), 1);
    }

    #[test]
    fn test_one_eyed_wink_is_not_a_blink() {
        let mut det = detector();
        let t0 = Instant::now();

        det.update_ears(OPEN, OPEN, at(t0, 0));
        det.update_ears(SHUT, OPEN, at(t0, 50));
        det.update_ears(SHUT, OPEN, at(t0, 100));
        det.update_ears(OPEN, OPEN, at(t0, 150));
        det.update_ears(OPEN, OPEN, at(t0, 200));
        assert_eq!(det.blink_count(), 0, "right eye never cycled");
    }

    #[test]
    fn test_too_slow_blink_rejected() {
        let mut det = detector();
        let t0 = Instant::now();

        det.update_ears(OPEN, OPEN, at(t0, 0));
        det.update_ears(SHUT, SHUT, at(t0, 50));
        // Eyes stay closed past max_blink_duration
        det.update_ears(SHUT, SHUT, at(t0, 500));
        det.update_ears(OPEN, OPEN, at(t0, 1000));
        det.update_ears(OPEN, OPEN, at(t0, 1010));
        assert_eq!(det.blink_count(), 0, "a 950ms cycle is not a blink");
    }

    #[test]
    fn test_desynchronized_eyes_rejected() {
        let mut det = detector();
        let t0 = Instant::now();

        // Left eye completes a full cycle early
        det.update_ears(SHUT, OPEN, at(t0, 0));
        det.update_ears(SHUT, OPEN, at(t0, 20));
        det.update_ears(OPEN, OPEN, at(t0, 40));
        det.update_ears(OPEN, OPEN, at(t0, 60));
        // Right eye cycles far outside the sync window
        det.update_ears(OPEN, SHUT, at(t0, 1000));
        det.update_ears(OPEN, SHUT, at(t0, 1020));
        det.update_ears(OPEN, OPEN, at(t0, 1040));
        let registered = det.update_ears(OPEN, OPEN, at(t0, 1060));
        assert!(!registered);
        assert_eq!(det.blink_count(), 0);
    }

    #[test]
    fn test_aborted_half_blink() {
        let mut det = detector();
        let t0 = Instant::now();

        det.update_ears(OPEN, OPEN, at(t0, 0));
        det.update_ears(MID, MID, at(t0, 50)); // closing but never closed
        det.update_ears(OPEN, OPEN, at(t0, 100));
        det.update_ears(SHUT, SHUT, at(t0, 150));
        det.update_ears(SHUT, SHUT, at(t0, 200));
        det.update_ears(OPEN, OPEN, at(t0, 250));
        det.update_ears(OPEN, OPEN, at(t0, 300));
        // Only the second dip was a real cycle
        assert_eq!(det.blink_count(), 1);
    }

    #[test]
    fn test_reset_clears_count_and_state() {
        let mut det = detector();
        let t0 = Instant::now();
        det.update_ears(SHUT, SHUT, at(t0, 0));
        det.update_ears(SHUT, SHUT, at(t0, 50));
        det.update_ears(OPEN, OPEN, at(t0, 100));
        det.update_ears(OPEN, OPEN, at(t0, 150));
        assert_eq!(det.blink_count(), 1);
        det.reset();
        assert_eq!(det.blink_count(), 0);
    }

    #[test]
    fn test_ear_geometry() {
        // Synthetic eye: horizontal span 10, vertical gaps 2 and 2 → EAR 0.2
        let mut mesh = vec![
            MeshLandmark { x: 0.0, y: 0.0, z: 0.0 };
            468
        ];
        let pts = [
            (0.0, 0.0),  // p0
            (3.0, -1.0), // p1
            (7.0, -1.0), // p2
            (10.0, 0.0), // p3
            (7.0, 1.0),  // p4
            (3.0, 1.0),  // p5
        ];
        for (slot, (x, y)) in LEFT_EYE.iter().zip(pts) {
            mesh[*slot] = MeshLandmark { x, y, z: 0.0 };
        }
        let ear = eye_aspect_ratio(&mesh, &LEFT_EYE).unwrap();
        assert!((ear - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_ear_rejects_degenerate_eye() {
        let mesh = vec![MeshLandmark { x: 0.0, y: 0.0, z: 0.0 }; 468];
        assert!(eye_aspect_ratio(&mesh, &LEFT_EYE).is_none());
    }

    #[test]
    fn test_ear_rejects_short_mesh() {
        let mesh = vec![MeshLandmark { x: 1.0, y: 1.0, z: 0.0 }; 100];
        assert!(ear_pair(&mesh).is_none());
    }
}
