//! sentinel-core — perception and decision primitives for face unlock.
//!
//! Detection (YuNet-family), embedding extraction (SFace-family),
//! anti-spoofing (MiniFASNet-family), dense landmarks, blink and head-pose
//! liveness, and Kalman face tracking, all running via ONNX Runtime on CPU.

pub mod alignment;
pub mod blink;
pub mod detector;
pub mod liveness;
pub mod mesh;
pub mod recognizer;
pub mod spoof;
pub mod tracker;
pub mod types;

pub use blink::{BlinkConfig, BlinkDetector};
pub use detector::{DetectorConfig, FaceDetector};
pub use liveness::{
    ChallengeConfig, ChallengeDirection, ChallengeFailure, ChallengeState, LivenessChallenge,
};
pub use mesh::{FaceMesh, MeshLandmark};
pub use recognizer::FaceRecognizer;
pub use spoof::{SpoofCalibration, SpoofDetector};
pub use tracker::{StabilityTracker, TrackedTarget, TrackerConfig};
pub use types::{Embedding, FaceDetection, MatchTier, TierThresholds, EMBEDDING_DIM};
