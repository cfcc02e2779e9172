//! Interactive liveness challenge: randomized head turn, then a blink.
//!
//! The random direction defeats replayed clips (the attacker cannot know
//! which way to turn); the mandatory blink afterwards defeats mannequins
//! and high-quality stills. The blink stage only opens once the pose has
//! been reached, so a pre-recorded blink cannot be banked.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::blink::{BlinkConfig, BlinkDetector};
use crate::mesh::MeshLandmark;

/// Neutral nose position on the eye→mouth vertical span (from the canonical
/// reference landmarks).
const NEUTRAL_NOSE_RATIO: f32 = 0.494;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDirection {
    Left,
    Right,
    Up,
    Down,
}

impl ChallengeDirection {
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        match rng.gen_range(0..4u8) {
            0 => Self::Left,
            1 => Self::Right,
            2 => Self::Up,
            _ => Self::Down,
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Left => "Turn your head LEFT",
            Self::Right => "Turn your head RIGHT",
            Self::Up => "Tilt your head UP",
            Self::Down => "Tilt your head DOWN",
        }
    }
}

/// Head pose estimated from the five detection landmarks, in degrees.
///
/// Yaw is positive when the nose sits right of the eye midline (image
/// coordinates); pitch is positive when the nose sits low on the
/// eye-to-mouth span (head tilted down).
pub fn head_pose(landmarks: &[(f32, f32); 5]) -> Option<(f32, f32)> {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = *landmarks;

    let eye_mid = ((left_eye.0 + right_eye.0) / 2.0, (left_eye.1 + right_eye.1) / 2.0);
    let mouth_mid = (
        (left_mouth.0 + right_mouth.0) / 2.0,
        (left_mouth.1 + right_mouth.1) / 2.0,
    );

    let interocular = ((right_eye.0 - left_eye.0).powi(2) + (right_eye.1 - left_eye.1).powi(2)).sqrt();
    let vertical_span = mouth_mid.1 - eye_mid.1;
    if interocular < 1.0 || vertical_span < 1.0 {
        return None;
    }

    let yaw_ratio = (nose.0 - eye_mid.0) / interocular;
    let nose_ratio = (nose.1 - eye_mid.1) / vertical_span;

    let yaw = (yaw_ratio * 1.5).atan().to_degrees();
    let pitch = ((nose_ratio - NEUTRAL_NOSE_RATIO) * 2.0).atan().to_degrees();

    Some((pitch, yaw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// Waiting for the head to reach the prompted direction.
    AwaitPose,
    /// Pose reached; waiting for the blink.
    AwaitBlink,
    Passed,
    Failed(ChallengeFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeFailure {
    Timeout,
    FaceLost,
}

#[derive(Debug, Clone, Copy)]
pub struct ChallengeConfig {
    /// Pose is reached when |pitch| or |yaw| exceeds this many degrees in
    /// the prompted direction.
    pub head_angle_threshold: f32,
    /// Whole-challenge deadline.
    pub timeout: Duration,
    /// Longest continuous face-track loss tolerated.
    pub grace: Duration,
    pub blink: BlinkConfig,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            head_angle_threshold: 15.0,
            timeout: Duration::from_secs(20),
            grace: Duration::from_millis(1500),
            blink: BlinkConfig::default(),
        }
    }
}

/// One challenge attempt. Created per session, never reused.
#[derive(Debug)]
pub struct LivenessChallenge {
    config: ChallengeConfig,
    direction: ChallengeDirection,
    state: ChallengeState,
    started_at: Instant,
    face_lost_since: Option<Instant>,
    blink: BlinkDetector,
}

impl LivenessChallenge {
    pub fn start<R: Rng>(config: ChallengeConfig, rng: &mut R) -> Self {
        Self::start_with_direction(config, ChallengeDirection::random(rng))
    }

    pub fn start_with_direction(config: ChallengeConfig, direction: ChallengeDirection) -> Self {
        tracing::info!(?direction, "liveness challenge started");
        Self {
            blink: BlinkDetector::new(config.blink),
            config,
            direction,
            state: ChallengeState::AwaitPose,
            started_at: Instant::now(),
            face_lost_since: None,
        }
    }

    pub fn direction(&self) -> ChallengeDirection {
        self.direction
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    /// Human-readable instruction for the current stage.
    pub fn instruction(&self) -> &'static str {
        match self.state {
            ChallengeState::AwaitPose => self.direction.prompt(),
            ChallengeState::AwaitBlink => "Now blink",
            ChallengeState::Passed => "Challenge passed",
            ChallengeState::Failed(_) => "Challenge failed",
        }
    }

    /// Advance with one observed frame of the tracked face.
    pub fn update(
        &mut self,
        landmarks: &[(f32, f32); 5],
        mesh: Option<&[MeshLandmark]>,
    ) -> ChallengeState {
        self.update_at(landmarks, mesh, Instant::now())
    }

    /// Report that the face track was missing this tick.
    pub fn face_lost(&mut self) -> ChallengeState {
        self.face_lost_at(Instant::now())
    }

    fn update_at(
        &mut self,
        landmarks: &[(f32, f32); 5],
        mesh: Option<&[MeshLandmark]>,
        now: Instant,
    ) -> ChallengeState {
        self.face_lost_since = None;

        if self.is_terminal() {
            return self.state;
        }
        if now.duration_since(self.started_at) > self.config.timeout {
            self.state = ChallengeState::Failed(ChallengeFailure::Timeout);
            return self.state;
        }

        match self.state {
            ChallengeState::AwaitPose => {
                if let Some((pitch, yaw)) = head_pose(landmarks) {
                    if self.pose_reached(pitch, yaw) {
                        tracing::debug!(pitch, yaw, "challenge pose reached");
                        self.blink.reset();
                        self.state = ChallengeState::AwaitBlink;
                    }
                }
            }
            ChallengeState::AwaitBlink => {
                if let Some(mesh) = mesh {
                    if self.blink.update(mesh) {
                        tracing::info!("challenge blink registered; liveness passed");
                        self.state = ChallengeState::Passed;
                    }
                }
            }
            _ => {}
        }

        self.state
    }

    fn face_lost_at(&mut self, now: Instant) -> ChallengeState {
        if self.is_terminal() {
            return self.state;
        }
        if now.duration_since(self.started_at) > self.config.timeout {
            self.state = ChallengeState::Failed(ChallengeFailure::Timeout);
            return self.state;
        }

        let since = *self.face_lost_since.get_or_insert(now);
        if now.duration_since(since) > self.config.grace {
            self.state = ChallengeState::Failed(ChallengeFailure::FaceLost);
        }
        self.state
    }

    fn pose_reached(&self, pitch: f32, yaw: f32) -> bool {
        let t = self.config.head_angle_threshold;
        match self.direction {
            ChallengeDirection::Left => yaw <= -t,
            ChallengeDirection::Right => yaw >= t,
            ChallengeDirection::Up => pitch <= -t,
            ChallengeDirection::Down => pitch >= t,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ChallengeState::Passed | ChallengeState::Failed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Neutral frontal face: eyes level, nose on the midline at the
    /// reference height ratio.
    fn neutral_landmarks() -> [(f32, f32); 5] {
        [
            (80.0, 60.0),   // left eye
            (120.0, 60.0),  // right eye
            (100.0, 79.8),  // nose (ratio ≈ 0.494 over a 40px span)
            (85.0, 100.0),  // left mouth
            (115.0, 100.0), // right mouth
        ]
    }

    fn turned(dx: f32, dy: f32) -> [(f32, f32); 5] {
        let mut lm = neutral_landmarks();
        lm[2].0 += dx;
        lm[2].1 += dy;
        lm
    }

    fn mesh_with_ears(ear: f32) -> Vec<MeshLandmark> {
        // Build a mesh whose eye contours produce the requested EAR:
        // horizontal span 10, vertical gaps = ear * 10.
        let mut mesh = vec![MeshLandmark { x: 0.0, y: 0.0, z: 0.0 }; 468];
        let v = ear * 10.0 / 2.0;
        for eye in [[362usize, 385, 387, 263, 373, 380], [33, 160, 158, 133, 153, 144]] {
            let pts = [
                (0.0, 0.0),
                (3.0, -v),
                (7.0, -v),
                (10.0, 0.0),
                (7.0, v),
                (3.0, v),
            ];
            for (slot, (x, y)) in eye.iter().zip(pts) {
                mesh[*slot] = MeshLandmark { x, y, z: 0.0 };
            }
        }
        mesh
    }

    fn config() -> ChallengeConfig {
        ChallengeConfig::default()
    }

    #[test]
    fn test_head_pose_neutral_is_small() {
        let (pitch, yaw) = head_pose(&neutral_landmarks()).unwrap();
        assert!(pitch.abs() < 3.0, "pitch = {pitch}");
        assert!(yaw.abs() < 1.0, "yaw = {yaw}");
    }

    #[test]
    fn test_head_pose_yaw_signs() {
        let (_, yaw_right) = head_pose(&turned(12.0, 0.0)).unwrap();
        let (_, yaw_left) = head_pose(&turned(-12.0, 0.0)).unwrap();
        assert!(yaw_right > 15.0, "yaw_right = {yaw_right}");
        assert!(yaw_left < -15.0, "yaw_left = {yaw_left}");
    }

    #[test]
    fn test_head_pose_pitch_signs() {
        let (pitch_down, _) = head_pose(&turned(0.0, 9.0)).unwrap();
        let (pitch_up, _) = head_pose(&turned(0.0, -9.0)).unwrap();
        assert!(pitch_down > 15.0, "pitch_down = {pitch_down}");
        assert!(pitch_up < -15.0, "pitch_up = {pitch_up}");
    }

    #[test]
    fn test_head_pose_rejects_degenerate_geometry() {
        let lm = [(50.0, 50.0); 5];
        assert!(head_pose(&lm).is_none());
    }

    #[test]
    fn test_pose_then_blink_passes() {
        let mut c =
            LivenessChallenge::start_with_direction(config(), ChallengeDirection::Right);

        // Neutral face: still waiting
        assert_eq!(c.update(&neutral_landmarks(), None), ChallengeState::AwaitPose);

        // Head turned right: pose stage completes
        assert_eq!(c.update(&turned(12.0, 0.0), None), ChallengeState::AwaitBlink);

        // Blink: two closed frames, then two open frames
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3)));
        let state = c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3)));
        assert_eq!(state, ChallengeState::Passed);
    }

    #[test]
    fn test_blink_before_pose_is_ignored() {
        let mut c =
            LivenessChallenge::start_with_direction(config(), ChallengeDirection::Left);

        // Blink while still in the pose stage
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3)));
        assert_eq!(c.state(), ChallengeState::AwaitPose);

        // Reach the pose, then a fresh blink is required
        assert_eq!(c.update(&turned(-12.0, 0.0), None), ChallengeState::AwaitBlink);
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.1)));
        c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3)));
        assert_eq!(
            c.update(&neutral_landmarks(), Some(&mesh_with_ears(0.3))),
            ChallengeState::Passed
        );
    }

    #[test]
    fn test_wrong_direction_does_not_advance() {
        let mut c =
            LivenessChallenge::start_with_direction(config(), ChallengeDirection::Up);
        assert_eq!(c.update(&turned(12.0, 0.0), None), ChallengeState::AwaitPose);
        assert_eq!(c.update(&turned(0.0, 9.0), None), ChallengeState::AwaitPose);
        assert_eq!(c.update(&turned(0.0, -9.0), None), ChallengeState::AwaitBlink);
    }

    #[test]
    fn test_timeout_fails_challenge() {
        let cfg = ChallengeConfig {
            timeout: Duration::from_millis(0),
            ..config()
        };
        let mut c = LivenessChallenge::start_with_direction(cfg, ChallengeDirection::Right);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            c.update(&neutral_landmarks(), None),
            ChallengeState::Failed(ChallengeFailure::Timeout)
        );
    }

    #[test]
    fn test_face_loss_grace_then_fail() {
        let cfg = ChallengeConfig {
            grace: Duration::from_millis(0),
            ..config()
        };
        let mut c = LivenessChallenge::start_with_direction(cfg, ChallengeDirection::Right);
        // First loss tick starts the grace window
        assert_eq!(c.face_lost(), ChallengeState::AwaitPose);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            c.face_lost(),
            ChallengeState::Failed(ChallengeFailure::FaceLost)
        );
    }

    #[test]
    fn test_face_reacquired_clears_grace() {
        let cfg = ChallengeConfig {
            grace: Duration::from_millis(50),
            ..config()
        };
        let mut c = LivenessChallenge::start_with_direction(cfg, ChallengeDirection::Right);
        c.face_lost();
        // Face comes back: the loss window resets
        c.update(&neutral_landmarks(), None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.face_lost(), ChallengeState::AwaitPose);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let cfg = ChallengeConfig {
            timeout: Duration::from_millis(0),
            ..config()
        };
        let mut c = LivenessChallenge::start_with_direction(cfg, ChallengeDirection::Right);
        std::thread::sleep(Duration::from_millis(2));
        c.update(&neutral_landmarks(), None);
        // Further updates cannot resurrect the challenge
        assert_eq!(
            c.update(&turned(12.0, 0.0), Some(&mesh_with_ears(0.3))),
            ChallengeState::Failed(ChallengeFailure::Timeout)
        );
    }

    #[test]
    fn test_random_direction_draws_all_variants() {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(format!("{:?}", ChallengeDirection::random(&mut rng)));
        }
        assert_eq!(seen.len(), 4);
    }
}
