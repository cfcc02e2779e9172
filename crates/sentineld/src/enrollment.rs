//! Guided enrollment: five poses, several embedding samples per pose.
//!
//! The caller polls `process_enroll_frame` until the session reports
//! `Ready` (exactly one face, large and steady enough, head aimed at the
//! target pose), then issues `capture_enroll_pose`. Capturing records
//! `samples_per_pose` embeddings into the enrolled segment and advances to
//! the next pose. Enrollment frames are also the known-live sequence the
//! anti-spoof calibration trains on.

use serde::Serialize;

use sentinel_core::liveness::head_pose;
use sentinel_core::{Embedding, FaceDetection};

use crate::gallery::Gallery;

/// The fixed pose sequence.
pub const POSE_SEQUENCE: [EnrollPose; 5] = [
    EnrollPose::Center,
    EnrollPose::Left,
    EnrollPose::Right,
    EnrollPose::Up,
    EnrollPose::Down,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollPose {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl EnrollPose {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Center => "CENTER",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Center => "Look directly at the camera",
            Self::Left => "Turn your head LEFT",
            Self::Right => "Turn your head RIGHT",
            Self::Up => "Tilt your head UP",
            Self::Down => "Tilt your head DOWN",
        }
    }

    /// Whether the measured head pose satisfies this target pose.
    fn matches(&self, pitch: f32, yaw: f32, angle_threshold: f32) -> bool {
        match self {
            Self::Center => pitch.abs() < angle_threshold && yaw.abs() < angle_threshold,
            Self::Left => yaw <= -angle_threshold,
            Self::Right => yaw >= angle_threshold,
            Self::Up => pitch <= -angle_threshold,
            Self::Down => pitch >= angle_threshold,
        }
    }
}

/// Frame assessment surfaced through `process_enroll_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollStatus {
    Ready,
    NoFace,
    MultipleFaces,
    FaceTooSmall,
    Unstable,
    WrongPose,
}

/// One enrollment session for one new user.
pub struct EnrollSession {
    gallery: Gallery,
    samples_per_pose: usize,
    current_pose: usize,
}

impl EnrollSession {
    pub fn new(user: &str, wears_glasses: bool, samples_per_pose: usize) -> Self {
        Self {
            gallery: Gallery::new(user, wears_glasses),
            samples_per_pose,
            current_pose: 0,
        }
    }

    pub fn user(&self) -> &str {
        &self.gallery.user
    }

    pub fn current_pose(&self) -> Option<EnrollPose> {
        POSE_SEQUENCE.get(self.current_pose).copied()
    }

    pub fn current_pose_index(&self) -> usize {
        self.current_pose
    }

    pub fn total_poses(&self) -> usize {
        POSE_SEQUENCE.len()
    }

    pub fn is_complete(&self) -> bool {
        self.current_pose >= POSE_SEQUENCE.len()
    }

    /// Judge whether the current frame is captureable for the target pose.
    pub fn assess(
        &self,
        detections: &[FaceDetection],
        stable: bool,
        min_face_px: f32,
        angle_threshold: f32,
    ) -> EnrollStatus {
        let Some(pose) = self.current_pose() else {
            return EnrollStatus::Ready;
        };

        let face = match detections {
            [] => return EnrollStatus::NoFace,
            [face] => face,
            _ => return EnrollStatus::MultipleFaces,
        };

        if face.width.min(face.height) < min_face_px {
            return EnrollStatus::FaceTooSmall;
        }
        if !stable {
            return EnrollStatus::Unstable;
        }

        match head_pose(&face.landmarks) {
            Some((pitch, yaw)) if pose.matches(pitch, yaw, angle_threshold) => EnrollStatus::Ready,
            _ => EnrollStatus::WrongPose,
        }
    }

    /// Record one embedding sample for the current pose.
    ///
    /// Returns true when the pose just filled up and the session advanced
    /// to the next one.
    pub fn record_sample(&mut self, embedding: Embedding) -> bool {
        if self.is_complete() {
            return false;
        }
        self.gallery.append_enrolled(embedding);

        let filled = self.gallery.segment_boundary;
        if filled >= (self.current_pose + 1) * self.samples_per_pose {
            self.current_pose += 1;
            true
        } else {
            false
        }
    }

    /// Samples still needed to finish the current pose.
    pub fn samples_remaining(&self) -> usize {
        if self.is_complete() {
            return 0;
        }
        let target = (self.current_pose + 1) * self.samples_per_pose;
        target - self.gallery.segment_boundary
    }

    /// Consume the session into the finished gallery.
    pub fn finish(self) -> Gallery {
        self.gallery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::types::EMBEDDING_DIM;

    fn axis_embedding(axis: usize) -> Embedding {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[axis] = 1.0;
        Embedding::from_raw(raw).unwrap()
    }

    fn face_with_nose(dx: f32, dy: f32) -> FaceDetection {
        FaceDetection {
            x: 200.0,
            y: 120.0,
            width: 160.0,
            height: 180.0,
            score: 0.95,
            landmarks: [
                (240.0, 180.0),
                (320.0, 180.0),
                (280.0 + dx, 219.6 + dy),
                (250.0, 260.0),
                (310.0, 260.0),
            ],
        }
    }

    fn session() -> EnrollSession {
        EnrollSession::new("alex", false, 4)
    }

    #[test]
    fn test_pose_sequence_order() {
        let names: Vec<_> = POSE_SEQUENCE.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["CENTER", "LEFT", "RIGHT", "UP", "DOWN"]);
    }

    #[test]
    fn test_assess_no_face() {
        let s = session();
        assert_eq!(s.assess(&[], true, 100.0, 15.0), EnrollStatus::NoFace);
    }

    #[test]
    fn test_assess_multiple_faces() {
        let s = session();
        let faces = vec![face_with_nose(0.0, 0.0), face_with_nose(1.0, 0.0)];
        assert_eq!(
            s.assess(&faces, true, 100.0, 15.0),
            EnrollStatus::MultipleFaces
        );
    }

    #[test]
    fn test_assess_small_face() {
        let s = session();
        let mut face = face_with_nose(0.0, 0.0);
        face.width = 80.0;
        assert_eq!(
            s.assess(&[face], true, 100.0, 15.0),
            EnrollStatus::FaceTooSmall
        );
    }

    #[test]
    fn test_assess_unstable() {
        let s = session();
        let face = face_with_nose(0.0, 0.0);
        assert_eq!(s.assess(&[face], false, 100.0, 15.0), EnrollStatus::Unstable);
    }

    #[test]
    fn test_assess_center_pose() {
        let s = session();
        assert_eq!(
            s.assess(&[face_with_nose(0.0, 0.0)], true, 100.0, 15.0),
            EnrollStatus::Ready
        );
        // Head turned hard right is not a CENTER capture
        assert_eq!(
            s.assess(&[face_with_nose(30.0, 0.0)], true, 100.0, 15.0),
            EnrollStatus::WrongPose
        );
    }

    #[test]
    fn test_assess_directional_poses() {
        let mut s = session();
        // Fill CENTER
        for i in 0..4 {
            s.record_sample(axis_embedding(i));
        }
        assert_eq!(s.current_pose(), Some(EnrollPose::Left));
        assert_eq!(
            s.assess(&[face_with_nose(-30.0, 0.0)], true, 100.0, 15.0),
            EnrollStatus::Ready
        );
        assert_eq!(
            s.assess(&[face_with_nose(30.0, 0.0)], true, 100.0, 15.0),
            EnrollStatus::WrongPose
        );
    }

    #[test]
    fn test_full_capture_flow() {
        let mut s = session();
        let mut advanced = 0;
        for i in 0..20 {
            if s.record_sample(axis_embedding(i)) {
                advanced += 1;
            }
        }
        assert_eq!(advanced, 5, "each pose advances exactly once");
        assert!(s.is_complete());
        assert_eq!(s.samples_remaining(), 0);

        let gallery = s.finish();
        assert_eq!(gallery.segment_boundary, 20);
        assert_eq!(gallery.enrolled().len(), 20);
        assert!(gallery.adaptive().is_empty());
    }

    #[test]
    fn test_samples_remaining_counts_down() {
        let mut s = session();
        assert_eq!(s.samples_remaining(), 4);
        s.record_sample(axis_embedding(0));
        assert_eq!(s.samples_remaining(), 3);
    }

    #[test]
    fn test_record_after_complete_is_ignored() {
        let mut s = session();
        for i in 0..20 {
            s.record_sample(axis_embedding(i));
        }
        assert!(!s.record_sample(axis_embedding(21)));
        assert_eq!(s.finish().embeddings.len(), 20);
    }
}
