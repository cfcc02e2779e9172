use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Daemon configuration snapshot.
///
/// Loaded once from `SENTINEL_*` environment variables with defaults, then
/// treated as immutable: `update_config` builds a new snapshot and the
/// service swaps the published `Arc` atomically. Nothing mutates a snapshot
/// in place.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device index (`/dev/video{N}`).
    pub camera_device_id: u32,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_fps: u32,
    pub camera_warmup_ms: u64,

    pub det_score_min: f32,
    pub nms_threshold: f32,
    pub min_face_px: f32,
    pub max_faces: usize,

    pub iou_reassoc: f32,
    pub max_lost_frames: u32,

    /// Cosine-distance tier bounds, each inclusive.
    pub golden_threshold: f32,
    pub standard_threshold: f32,
    pub twofa_threshold: f32,
    /// Pre-match rejection bound; strictly looser than `twofa_threshold`.
    pub blacklist_match_threshold: f32,
    pub max_retries: u32,
    pub max_spoof_fails: u32,
    pub global_session_timeout_secs: f64,

    pub ear_open: f32,
    pub ear_closed: f32,
    pub challenge_timeout_secs: f64,
    pub spoof_threshold: f32,
    pub head_angle_threshold: f32,
    pub blink_sync_window_ms: u64,
    pub max_blink_duration_ms: u64,
    pub challenge_grace_ms: u64,

    pub adaptation_limit_per_day: u32,
    pub initial_adaptations_require_password: u32,
    pub max_adaptive: usize,
    pub min_adaptive_diversity: f32,
    pub max_adaptive_distance: f32,

    pub max_age_days: i64,
    pub log_retention_days: u32,
    pub samples_per_pose: usize,

    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding galleries, blacklist, and calibration.
    pub state_dir: PathBuf,
    /// Directory for daily audit logs.
    pub log_dir: PathBuf,
    /// Control socket path.
    pub socket_path: PathBuf,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("threshold ordering violated: golden < standard < twofa < blacklist required")]
    ThresholdOrdering,
}

impl Config {
    /// Load configuration from `SENTINEL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let state_dir = std::env::var("SENTINEL_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/sentinel"));

        Self {
            camera_device_id: env_u32("SENTINEL_CAMERA_DEVICE", 0),
            camera_width: env_u32("SENTINEL_CAMERA_WIDTH", 640),
            camera_height: env_u32("SENTINEL_CAMERA_HEIGHT", 480),
            camera_fps: env_u32("SENTINEL_CAMERA_FPS", 15),
            camera_warmup_ms: env_u64("SENTINEL_CAMERA_WARMUP_MS", 500),

            det_score_min: env_f32("SENTINEL_DET_SCORE_MIN", 0.6),
            nms_threshold: env_f32("SENTINEL_NMS_THRESHOLD", 0.3),
            min_face_px: env_f32("SENTINEL_MIN_FACE_PX", 100.0),
            max_faces: env_usize("SENTINEL_MAX_FACES", 5),

            iou_reassoc: env_f32("SENTINEL_IOU_REASSOC", 0.3),
            max_lost_frames: env_u32("SENTINEL_MAX_LOST_FRAMES", 30),

            golden_threshold: env_f32("SENTINEL_GOLDEN_THRESHOLD", 0.25),
            standard_threshold: env_f32("SENTINEL_STANDARD_THRESHOLD", 0.42),
            twofa_threshold: env_f32("SENTINEL_TWOFA_THRESHOLD", 0.50),
            blacklist_match_threshold: env_f32("SENTINEL_BLACKLIST_MATCH_THRESHOLD", 0.55),
            max_retries: env_u32("SENTINEL_MAX_RETRIES", 3),
            max_spoof_fails: env_u32("SENTINEL_MAX_SPOOF_FAILS", 3),
            global_session_timeout_secs: env_f64("SENTINEL_SESSION_TIMEOUT_SECS", 25.0),

            ear_open: env_f32("SENTINEL_EAR_OPEN", 0.24),
            ear_closed: env_f32("SENTINEL_EAR_CLOSED", 0.19),
            challenge_timeout_secs: env_f64("SENTINEL_CHALLENGE_TIMEOUT_SECS", 20.0),
            spoof_threshold: env_f32("SENTINEL_SPOOF_THRESHOLD", 0.92),
            head_angle_threshold: env_f32("SENTINEL_HEAD_ANGLE_THRESHOLD", 15.0),
            blink_sync_window_ms: env_u64("SENTINEL_BLINK_SYNC_WINDOW_MS", 400),
            max_blink_duration_ms: env_u64("SENTINEL_MAX_BLINK_DURATION_MS", 800),
            challenge_grace_ms: env_u64("SENTINEL_CHALLENGE_GRACE_MS", 1500),

            adaptation_limit_per_day: env_u32("SENTINEL_ADAPTATION_LIMIT_PER_DAY", 1),
            initial_adaptations_require_password: env_u32(
                "SENTINEL_INITIAL_ADAPTATIONS_REQUIRE_PASSWORD",
                3,
            ),
            max_adaptive: env_usize("SENTINEL_MAX_ADAPTIVE", 20),
            min_adaptive_diversity: env_f32("SENTINEL_MIN_ADAPTIVE_DIVERSITY", 0.05),
            max_adaptive_distance: env_f32("SENTINEL_MAX_ADAPTIVE_DISTANCE", 0.40),

            max_age_days: env_i64("SENTINEL_MAX_AGE_DAYS", 45),
            log_retention_days: env_u32("SENTINEL_LOG_RETENTION_DAYS", 30),
            samples_per_pose: env_usize("SENTINEL_SAMPLES_PER_POSE", 4),

            model_dir: std::env::var("SENTINEL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/share/sentinel/models")),
            log_dir: std::env::var("SENTINEL_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| state_dir.join("logs")),
            socket_path: std::env::var("SENTINEL_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/run/sentinel/sentinel.sock")),
            state_dir,
        }
    }

    /// Minimum usable gallery size: every pose fully sampled.
    pub fn min_enrolled(&self) -> usize {
        crate::enrollment::POSE_SEQUENCE.len() * self.samples_per_pose
    }

    /// Flat key → value map of the published thresholds.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        let mut put = |k: &str, v: Value| {
            map.insert(k.to_string(), v);
        };

        put("camera.device_id", json!(self.camera_device_id));
        put("camera.width", json!(self.camera_width));
        put("camera.height", json!(self.camera_height));
        put("camera.fps", json!(self.camera_fps));
        put("camera.warmup_ms", json!(self.camera_warmup_ms));

        put("detection.det_score_min", json!(self.det_score_min));
        put("detection.nms_threshold", json!(self.nms_threshold));
        put("detection.min_face_px", json!(self.min_face_px));
        put("detection.max_faces", json!(self.max_faces));

        put("tracking.iou_reassoc", json!(self.iou_reassoc));
        put("tracking.max_lost_frames", json!(self.max_lost_frames));

        put("security.golden_threshold", json!(self.golden_threshold));
        put("security.standard_threshold", json!(self.standard_threshold));
        put("security.twofa_threshold", json!(self.twofa_threshold));
        put(
            "security.blacklist_match_threshold",
            json!(self.blacklist_match_threshold),
        );
        put("security.max_retries", json!(self.max_retries));
        put("security.max_spoof_fails", json!(self.max_spoof_fails));
        put(
            "security.global_session_timeout",
            json!(self.global_session_timeout_secs),
        );

        put("liveness.ear_open", json!(self.ear_open));
        put("liveness.ear_closed", json!(self.ear_closed));
        put("liveness.challenge_timeout", json!(self.challenge_timeout_secs));
        put("liveness.spoof_threshold", json!(self.spoof_threshold));
        put(
            "liveness.head_angle_threshold",
            json!(self.head_angle_threshold),
        );
        put("liveness.blink_sync_window_ms", json!(self.blink_sync_window_ms));
        put(
            "liveness.max_blink_duration_ms",
            json!(self.max_blink_duration_ms),
        );
        put("liveness.challenge_grace_ms", json!(self.challenge_grace_ms));

        put(
            "adaptive.adaptation_limit_per_day",
            json!(self.adaptation_limit_per_day),
        );
        put(
            "adaptive.initial_adaptations_require_password",
            json!(self.initial_adaptations_require_password),
        );
        put("adaptive.max_adaptive", json!(self.max_adaptive));
        put(
            "adaptive.min_adaptive_diversity",
            json!(self.min_adaptive_diversity),
        );
        put(
            "adaptive.max_adaptive_distance",
            json!(self.max_adaptive_distance),
        );

        put("storage.max_age_days", json!(self.max_age_days));
        put("storage.log_retention_days", json!(self.log_retention_days));

        map
    }

    /// Build a new snapshot with the given key updates applied.
    ///
    /// All keys are validated before anything is applied; an error leaves
    /// the current snapshot untouched (no partial apply).
    pub fn with_updates(&self, updates: &BTreeMap<String, Value>) -> Result<Config, ConfigError> {
        let mut next = self.clone();

        for (key, value) in updates {
            apply_key(&mut next, key, value)?;
        }

        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.golden_threshold < self.standard_threshold
            && self.standard_threshold < self.twofa_threshold
            && self.twofa_threshold < self.blacklist_match_threshold)
        {
            return Err(ConfigError::ThresholdOrdering);
        }
        if self.ear_closed >= self.ear_open {
            return Err(ConfigError::InvalidValue {
                key: "liveness.ear_closed".into(),
                reason: "must be below liveness.ear_open".into(),
            });
        }
        Ok(())
    }

    /// Digest over the published key set; `initialize` skips a model reload
    /// when this is unchanged.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (k, v) in self.to_map() {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_detection_yunet_2023mar.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join("face_recognition_sface_2021dec.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn spoof_model_path(&self) -> String {
        self.model_dir
            .join("minifasnet_v2.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn mesh_model_path(&self) -> String {
        self.model_dir
            .join("face_mesh_attention.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn spoof_calibration_path(&self) -> PathBuf {
        self.state_dir.join("spoof_calibration.json")
    }
}

fn apply_key(config: &mut Config, key: &str, value: &Value) -> Result<(), ConfigError> {
    let bad = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let as_f32 = |v: &Value| v.as_f64().map(|f| f as f32).ok_or_else(|| bad("expected number"));
    let as_f64 = |v: &Value| v.as_f64().ok_or_else(|| bad("expected number"));
    let as_u32 = |v: &Value| {
        v.as_u64()
            .and_then(|u| u32::try_from(u).ok())
            .ok_or_else(|| bad("expected non-negative integer"))
    };
    let as_u64 = |v: &Value| v.as_u64().ok_or_else(|| bad("expected non-negative integer"));
    let as_usize = |v: &Value| {
        v.as_u64()
            .map(|u| u as usize)
            .ok_or_else(|| bad("expected non-negative integer"))
    };
    let as_i64 = |v: &Value| v.as_i64().ok_or_else(|| bad("expected integer"));

    match key {
        "camera.device_id" => config.camera_device_id = as_u32(value)?,
        "camera.width" => config.camera_width = as_u32(value)?,
        "camera.height" => config.camera_height = as_u32(value)?,
        "camera.fps" => config.camera_fps = as_u32(value)?,
        "camera.warmup_ms" => config.camera_warmup_ms = as_u64(value)?,

        "detection.det_score_min" => config.det_score_min = as_f32(value)?,
        "detection.nms_threshold" => config.nms_threshold = as_f32(value)?,
        "detection.min_face_px" => config.min_face_px = as_f32(value)?,
        "detection.max_faces" => config.max_faces = as_usize(value)?,

        "tracking.iou_reassoc" => config.iou_reassoc = as_f32(value)?,
        "tracking.max_lost_frames" => config.max_lost_frames = as_u32(value)?,

        "security.golden_threshold" => config.golden_threshold = as_f32(value)?,
        "security.standard_threshold" => config.standard_threshold = as_f32(value)?,
        "security.twofa_threshold" => config.twofa_threshold = as_f32(value)?,
        "security.blacklist_match_threshold" => {
            config.blacklist_match_threshold = as_f32(value)?;
        }
        "security.max_retries" => config.max_retries = as_u32(value)?,
        "security.max_spoof_fails" => config.max_spoof_fails = as_u32(value)?,
        "security.global_session_timeout" => {
            config.global_session_timeout_secs = as_f64(value)?;
        }

        "liveness.ear_open" => config.ear_open = as_f32(value)?,
        "liveness.ear_closed" => config.ear_closed = as_f32(value)?,
        "liveness.challenge_timeout" => config.challenge_timeout_secs = as_f64(value)?,
        "liveness.spoof_threshold" => config.spoof_threshold = as_f32(value)?,
        "liveness.head_angle_threshold" => config.head_angle_threshold = as_f32(value)?,
        "liveness.blink_sync_window_ms" => config.blink_sync_window_ms = as_u64(value)?,
        "liveness.max_blink_duration_ms" => config.max_blink_duration_ms = as_u64(value)?,
        "liveness.challenge_grace_ms" => config.challenge_grace_ms = as_u64(value)?,

        "adaptive.adaptation_limit_per_day" => {
            config.adaptation_limit_per_day = as_u32(value)?;
        }
        "adaptive.initial_adaptations_require_password" => {
            config.initial_adaptations_require_password = as_u32(value)?;
        }
        "adaptive.max_adaptive" => config.max_adaptive = as_usize(value)?,
        "adaptive.min_adaptive_diversity" => config.min_adaptive_diversity = as_f32(value)?,
        "adaptive.max_adaptive_distance" => config.max_adaptive_distance = as_f32(value)?,

        "storage.max_age_days" => config.max_age_days = as_i64(value)?,
        "storage.log_retention_days" => config.log_retention_days = as_u32(value)?,

        other => return Err(ConfigError::UnknownKey(other.to_string())),
    }
    Ok(())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::from_env()
    }

    #[test]
    fn test_defaults_are_valid() {
        defaults().validate().unwrap();
    }

    #[test]
    fn test_blacklist_threshold_looser_than_twofa() {
        let c = defaults();
        assert!(c.blacklist_match_threshold > c.twofa_threshold);
    }

    #[test]
    fn test_update_swaps_value() {
        let c = defaults();
        let mut updates = BTreeMap::new();
        updates.insert("security.max_retries".to_string(), json!(5));
        let next = c.with_updates(&updates).unwrap();
        assert_eq!(next.max_retries, 5);
        assert_eq!(c.max_retries, 3, "original snapshot untouched");
    }

    #[test]
    fn test_update_rejects_unknown_key() {
        let c = defaults();
        let mut updates = BTreeMap::new();
        updates.insert("security.nope".to_string(), json!(1));
        assert!(matches!(
            c.with_updates(&updates),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_update_rejects_threshold_inversion() {
        let c = defaults();
        let mut updates = BTreeMap::new();
        updates.insert("security.golden_threshold".to_string(), json!(0.6));
        assert!(matches!(
            c.with_updates(&updates),
            Err(ConfigError::ThresholdOrdering)
        ));
    }

    #[test]
    fn test_no_partial_apply() {
        let c = defaults();
        let mut updates = BTreeMap::new();
        updates.insert("security.max_retries".to_string(), json!(9));
        updates.insert("bogus.key".to_string(), json!(1));
        assert!(c.with_updates(&updates).is_err());
        // The valid key in the same batch must not leak through
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn test_digest_tracks_published_keys() {
        let c = defaults();
        let mut updates = BTreeMap::new();
        updates.insert("liveness.spoof_threshold".to_string(), json!(0.95));
        let next = c.with_updates(&updates).unwrap();
        assert_ne!(c.digest(), next.digest());
        assert_eq!(c.digest(), c.digest());
    }

    #[test]
    fn test_map_round_trips_through_updates() {
        let c = defaults();
        let map = c.to_map();
        let next = c.with_updates(&map).unwrap();
        assert_eq!(c.digest(), next.digest());
    }

    #[test]
    fn test_min_enrolled_counts_all_poses() {
        let c = defaults();
        assert_eq!(c.min_enrolled(), 20);
    }
}
