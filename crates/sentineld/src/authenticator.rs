//! The authentication session state machine.
//!
//! One `AuthSession` lives for exactly one `authenticate` call and drives
//! the perception pipeline tick by tick: acquire a stable face, pre-match
//! against the blacklist, gate on anti-spoofing, match against the
//! galleries, and — for golden-tier matches — run the interactive liveness
//! challenge. All timing is measured against a single monotonic
//! `session_start`; the global timeout applies in every state, and
//! cancellation is checked at the top of every tick.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use sentinel_core::liveness::{ChallengeConfig, ChallengeState, LivenessChallenge};
use sentinel_core::tracker::{StabilityTracker, TrackerConfig};
use sentinel_core::{BlinkConfig, Embedding, FaceDetection, MatchTier, MeshLandmark, TierThresholds};
use sentinel_hw::Frame;

use crate::audit::{AuditLog, AuditRecord};
use crate::blacklist::BlacklistManager;
use crate::config::Config;
use crate::gallery::{match_probe, Gallery};

/// Consecutive inference failures tolerated before the session degrades to
/// `FAILURE(INTERNAL)`.
const INFER_ERROR_BUDGET: u32 = 5;

#[derive(Error, Debug)]
pub enum InferError {
    #[error("detector: {0}")]
    Detect(String),
    #[error("recognizer: {0}")]
    Recognize(String),
    #[error("mesh: {0}")]
    Mesh(String),
}

/// The perception capability set the state machine consumes.
///
/// One concrete implementation wraps the ONNX sessions; tests substitute a
/// scripted backend. Swapping models is a construction-time choice.
pub trait InferenceBackend {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, InferError>;
    fn recognize(&mut self, frame: &Frame, face: &FaceDetection) -> Result<Embedding, InferError>;
    /// `(live, score)`; failures are reported as `(false, 0.0)` inside.
    fn antispoof(&mut self, frame: &Frame, face_box: (f32, f32, f32, f32)) -> (bool, f32);
    fn mesh(
        &mut self,
        frame: &Frame,
        face_box: (f32, f32, f32, f32),
    ) -> Result<Vec<MeshLandmark>, InferError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Timeout,
    Spoof,
    Liveness,
    Denied,
    BlockedIntruder,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Spoof => "SPOOF",
            Self::Liveness => "LIVENESS",
            Self::Denied => "DENIED",
            Self::BlockedIntruder => "BLOCKED_INTRUDER",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Success { user: String, tier: MatchTier },
    Require2fa { user: String, distance: f32 },
    Failure(FailureKind),
}

#[derive(Debug)]
enum Phase {
    /// Waiting for a locked, live, identified face.
    Acquire,
    /// Golden-tier match found; interactive challenge in progress.
    Challenge {
        user: String,
        challenge: LivenessChallenge,
    },
    Terminal(AuthOutcome),
}

/// Client-visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublicState {
    Acquiring,
    Challenge,
    Success,
    #[serde(rename = "REQUIRE_2FA")]
    Require2fa,
    Failure,
}

/// Per-tick report surfaced through `process_auth_frame`.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub state: PublicState,
    pub message: String,
    pub face_box: Option<(f32, f32, f32, f32)>,
    pub matched_user: Option<String>,
    pub distance: Option<f32>,
    pub tier: Option<MatchTier>,
    pub failure: Option<FailureKind>,
}

/// Probe queued for adaptive learning after a golden success.
#[derive(Debug, Clone)]
pub struct PendingAdapt {
    pub user: String,
    pub embedding: Embedding,
}

/// One authentication session.
pub struct AuthSession {
    config: Arc<Config>,
    target_user: Option<String>,
    galleries: Vec<Gallery>,
    tracker: StabilityTracker,
    phase: Phase,
    started: Instant,
    last_sequence: u64,
    spoof_fails: u32,
    session_fails: u32,
    infer_errors: u32,
    matched_user: Option<String>,
    last_distance: Option<f32>,
    active_tier: Option<MatchTier>,
    pending_adapt: Option<PendingAdapt>,
    /// Quarantine entries this session wrote; excluded from its own
    /// pre-match so retries are not short-circuited.
    own_quarantine: Vec<String>,
    message: String,
}

impl AuthSession {
    /// Begin a session against the given (already validated, non-expired)
    /// galleries. `target_user` restricts matching to one user.
    pub fn new(config: Arc<Config>, target_user: Option<String>, galleries: Vec<Gallery>) -> Self {
        let tracker = StabilityTracker::new(TrackerConfig {
            iou_reassoc: config.iou_reassoc,
            max_lost_frames: config.max_lost_frames,
            min_face_px: config.min_face_px,
            dt: 1.0 / f64::from(config.camera_fps.max(1)),
        });

        Self {
            config,
            target_user,
            galleries,
            tracker,
            phase: Phase::Acquire,
            started: Instant::now(),
            last_sequence: 0,
            spoof_fails: 0,
            session_fails: 0,
            infer_errors: 0,
            matched_user: None,
            last_distance: None,
            active_tier: None,
            pending_adapt: None,
            own_quarantine: Vec::new(),
            message: "Look at the camera".to_string(),
        }
    }

    pub fn outcome(&self) -> Option<&AuthOutcome> {
        match &self.phase {
            Phase::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Probe queued on golden success, consumed once by the adaptive manager.
    pub fn take_pending_adapt(&mut self) -> Option<PendingAdapt> {
        self.pending_adapt.take()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Cooperative cancellation (dispatcher stop or client disconnect).
    pub fn cancel(&mut self, audit: &AuditLog) {
        if !self.is_terminal() {
            self.audit(audit, "CANCELLED", "Session cancelled");
            self.phase = Phase::Terminal(AuthOutcome::Failure(FailureKind::Cancelled));
        }
    }

    /// Advance the state machine by one frame.
    pub fn tick(
        &mut self,
        frame: &Frame,
        backend: &mut dyn InferenceBackend,
        blacklist: &mut BlacklistManager,
        audit: &AuditLog,
    ) -> TickReport {
        if let Phase::Terminal(_) = self.phase {
            return self.report(None);
        }

        // Global timeout applies regardless of state.
        if self.elapsed_secs() > self.config.global_session_timeout_secs {
            self.audit(audit, "TIMEOUT", "Global session timeout");
            return self.fail(FailureKind::Timeout, "Session timed out");
        }

        // Only act on frames newer than the last observed one.
        if self.last_sequence != 0 && frame.sequence <= self.last_sequence {
            return self.report(None);
        }
        self.last_sequence = frame.sequence;

        // Detection runs on a contrast-enhanced copy; everything downstream
        // consumes the raw frame.
        let mut enhanced = frame.clone();
        sentinel_hw::frame::clahe_enhance(&mut enhanced, 8, 0.02);
        let detections = match backend.detect(&enhanced) {
            Ok(d) => d,
            Err(e) => return self.infer_failure(audit, e),
        };

        let Some(target) = self.tracker.update(&detections) else {
            return self.no_target_tick(audit);
        };
        let face_box = target.smoothed_box;

        if matches!(self.phase, Phase::Challenge { .. }) {
            self.challenge_tick(frame, &target.detection, face_box, backend, audit)
        } else {
            self.acquire_tick(frame, &target.detection, face_box, backend, blacklist, audit)
        }
    }

    /// ACQUIRE with a locked target: PREMATCH → SPOOFCHECK → MATCH.
    fn acquire_tick(
        &mut self,
        frame: &Frame,
        detection: &FaceDetection,
        face_box: (f32, f32, f32, f32),
        backend: &mut dyn InferenceBackend,
        blacklist: &mut BlacklistManager,
        audit: &AuditLog,
    ) -> TickReport {
        // PREMATCH: compute the probe and reject known intruders before
        // identification. The threshold here is deliberately looser than
        // the recognition tiers.
        let probe = match backend.recognize(frame, detection) {
            Ok(p) => p,
            Err(e) => return self.infer_failure(audit, e),
        };

        if let Some(hit) = blacklist.check(
            &probe,
            self.config.blacklist_match_threshold,
            &self.own_quarantine,
        ) {
            self.audit(
                audit,
                "BLOCKED",
                &format!("Blacklist pre-match hit (dist {:.3})", hit.distance),
            );
            return self.fail(FailureKind::BlockedIntruder, "Access denied");
        }

        // SPOOFCHECK on the current crop.
        let (live, spoof_score) = backend.antispoof(frame, face_box);
        if !live {
            self.spoof_fails += 1;
            self.audit(
                audit,
                "WARNING",
                &format!("Spoof suspected (score {spoof_score:.2}, fail {})", self.spoof_fails),
            );
            if self.spoof_fails >= self.config.max_spoof_fails {
                self.audit(audit, "FAILURE", "Spoof fail budget exhausted");
                return self.fail(FailureKind::Spoof, "Presentation attack suspected");
            }
            // SPOOFRETRY: drop the lock and re-acquire.
            self.tracker.reset();
            self.message = "Hold still, checking again".to_string();
            return self.report(Some(face_box));
        }

        // MATCH against the target user's gallery (or all galleries).
        let matched = match_probe(&self.galleries, &probe);
        let Some(matched) = matched else {
            return self.intrusion(frame, &probe, blacklist, audit, face_box);
        };

        let thresholds = TierThresholds {
            golden: self.config.golden_threshold,
            standard: self.config.standard_threshold,
            twofa: self.config.twofa_threshold,
        };
        let tier = thresholds.classify(matched.distance);
        self.last_distance = Some(matched.distance);
        self.active_tier = Some(tier);

        match tier {
            MatchTier::Golden => {
                info!(user = %matched.user, dist = matched.distance, "golden-tier match; starting challenge");
                self.matched_user = Some(matched.user.clone());
                self.pending_adapt = Some(PendingAdapt {
                    user: matched.user.clone(),
                    embedding: probe,
                });

                let challenge = LivenessChallenge::start(
                    ChallengeConfig {
                        head_angle_threshold: self.config.head_angle_threshold,
                        timeout: std::time::Duration::from_secs_f64(self.config.challenge_timeout_secs),
                        grace: std::time::Duration::from_millis(self.config.challenge_grace_ms),
                        blink: BlinkConfig {
                            ear_open: self.config.ear_open,
                            ear_closed: self.config.ear_closed,
                            max_blink_duration: std::time::Duration::from_millis(
                                self.config.max_blink_duration_ms,
                            ),
                            sync_window: std::time::Duration::from_millis(
                                self.config.blink_sync_window_ms,
                            ),
                        },
                    },
                    &mut rand::thread_rng(),
                );
                self.message = format!("Hi {}! {}", matched.user, challenge.instruction());
                self.phase = Phase::Challenge {
                    user: matched.user,
                    challenge,
                };
                self.report(Some(face_box))
            }
            MatchTier::Standard => {
                self.matched_user = Some(matched.user.clone());
                self.audit(audit, "SUCCESS", "Access granted (standard tier)");
                self.message = format!("Access granted: {}", matched.user);
                self.phase = Phase::Terminal(AuthOutcome::Success {
                    user: matched.user,
                    tier: MatchTier::Standard,
                });
                self.report(Some(face_box))
            }
            MatchTier::TwoFactor => {
                self.matched_user = Some(matched.user.clone());
                self.audit(audit, "SUCCESS_2FA", "Biometrics borderline, password required");
                self.message = format!("Additional verification required: {}", matched.user);
                self.phase = Phase::Terminal(AuthOutcome::Require2fa {
                    user: matched.user,
                    distance: matched.distance,
                });
                self.report(Some(face_box))
            }
            MatchTier::Unmatched => self.intrusion(frame, &probe, blacklist, audit, face_box),
        }
    }

    /// INTRUSION: quarantine the probe and either retry or deny.
    fn intrusion(
        &mut self,
        frame: &Frame,
        probe: &Embedding,
        blacklist: &mut BlacklistManager,
        audit: &AuditLog,
        face_box: (f32, f32, f32, f32),
    ) -> TickReport {
        let screenshot = sentinel_hw::frame::encode_jpeg(frame, 85).unwrap_or_default();
        match blacklist.record_intrusion(probe, &screenshot) {
            Ok(id) => {
                self.audit(audit, "INTRUSION", &format!("Unknown face quarantined ({id})"));
                self.own_quarantine.push(id);
            }
            Err(e) => warn!(error = %e, "failed to record intrusion"),
        }

        self.session_fails += 1;
        if self.session_fails >= self.config.max_retries {
            self.audit(audit, "FAILURE", "Retry budget exhausted");
            return self.fail(FailureKind::Denied, "Access denied");
        }

        self.tracker.reset();
        self.message = format!(
            "Not recognized. Attempts left: {}",
            self.config.max_retries - self.session_fails
        );
        self.report(Some(face_box))
    }

    /// CHALLENGE: drive the head-turn + blink validator.
    fn challenge_tick(
        &mut self,
        frame: &Frame,
        detection: &FaceDetection,
        face_box: (f32, f32, f32, f32),
        backend: &mut dyn InferenceBackend,
        audit: &AuditLog,
    ) -> TickReport {
        let mesh = match backend.mesh(frame, face_box) {
            Ok(m) => Some(m),
            Err(_) => None, // pose stage needs no mesh; blink will retry
        };

        let Phase::Challenge { user, challenge } = &mut self.phase else {
            return self.report(Some(face_box));
        };
        let user = user.clone();

        let state = challenge.update(&detection.landmarks, mesh.as_deref());
        self.message = format!("Hi {user}! {}", challenge.instruction());

        match state {
            ChallengeState::Passed => {
                self.audit(audit, "SUCCESS", "Access granted (golden tier, challenge passed)");
                self.message = format!("Access granted: {user}");
                self.phase = Phase::Terminal(AuthOutcome::Success {
                    user,
                    tier: MatchTier::Golden,
                });
                self.report(Some(face_box))
            }
            ChallengeState::Failed(reason) => {
                self.audit(audit, "FAILURE", &format!("Challenge failed: {reason:?}"));
                self.pending_adapt = None;
                self.fail(FailureKind::Liveness, "Liveness challenge failed")
            }
            _ => self.report(Some(face_box)),
        }
    }

    /// No target this tick: either still acquiring or losing the challenge
    /// subject.
    fn no_target_tick(&mut self, audit: &AuditLog) -> TickReport {
        if let Phase::Challenge { challenge, .. } = &mut self.phase {
            if let ChallengeState::Failed(reason) = challenge.face_lost() {
                self.audit(audit, "FAILURE", &format!("Face lost during challenge: {reason:?}"));
                self.pending_adapt = None;
                return self.fail(FailureKind::Liveness, "Face lost during challenge");
            }
        } else {
            self.message = "Scanning for a face".to_string();
        }
        self.report(None)
    }

    fn infer_failure(&mut self, audit: &AuditLog, error: InferError) -> TickReport {
        self.infer_errors += 1;
        warn!(error = %error, budget = INFER_ERROR_BUDGET, count = self.infer_errors, "inference error");
        if self.infer_errors >= INFER_ERROR_BUDGET {
            self.audit(audit, "FAILURE", "Inference error budget exhausted");
            return self.fail(FailureKind::Internal, "Internal error");
        }
        self.report(None)
    }

    fn fail(&mut self, kind: FailureKind, message: &str) -> TickReport {
        self.message = message.to_string();
        self.phase = Phase::Terminal(AuthOutcome::Failure(kind));
        self.report(None)
    }

    fn report(&self, face_box: Option<(f32, f32, f32, f32)>) -> TickReport {
        let (state, failure) = match &self.phase {
            Phase::Acquire => (PublicState::Acquiring, None),
            Phase::Challenge { .. } => (PublicState::Challenge, None),
            Phase::Terminal(AuthOutcome::Success { .. }) => (PublicState::Success, None),
            Phase::Terminal(AuthOutcome::Require2fa { .. }) => (PublicState::Require2fa, None),
            Phase::Terminal(AuthOutcome::Failure(kind)) => (PublicState::Failure, Some(*kind)),
        };

        TickReport {
            state,
            message: self.message.clone(),
            face_box,
            matched_user: self.matched_user.clone(),
            distance: self.last_distance,
            tier: self.active_tier,
            failure,
        }
    }

    fn audit(&self, audit: &AuditLog, status: &str, message: &str) {
        audit.record(&AuditRecord {
            status,
            message,
            user: self.matched_user.as_deref().or(self.target_user.as_deref()),
            distance: self.last_distance,
            tier: self.active_tier.map(tier_str),
            retries: self.session_fails,
            duration_secs: self.elapsed_secs(),
        });
    }
}

pub fn tier_str(tier: MatchTier) -> &'static str {
    match tier {
        MatchTier::Golden => "GOLDEN",
        MatchTier::Standard => "STANDARD",
        MatchTier::TwoFactor => "2FA",
        MatchTier::Unmatched => "NONE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::types::EMBEDDING_DIM;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn axis_embedding(axis: usize) -> Embedding {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[axis] = 1.0;
        Embedding::from_raw(raw).unwrap()
    }

    /// Probe at a controlled cosine distance from gallery axis 0, mixed
    /// with an axis no gallery entry occupies.
    fn embedding_at_distance(dist: f32) -> Embedding {
        let c = 1.0 - dist;
        let s = (1.0 - c * c).max(0.0).sqrt();
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[0] = c;
        raw[30] = s;
        Embedding::from_raw(raw).unwrap()
    }

    /// Scripted perception: fixed detection, queued recognition results and
    /// spoof verdicts.
    struct ScriptedBackend {
        detection: Option<FaceDetection>,
        probes: VecDeque<Embedding>,
        spoof: VecDeque<(bool, f32)>,
        mesh: Vec<MeshLandmark>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                detection: Some(frontal_face()),
                probes: VecDeque::new(),
                spoof: VecDeque::new(),
                mesh: Vec::new(),
            }
        }

        fn live() -> (bool, f32) {
            (true, 0.98)
        }
    }

    impl InferenceBackend for ScriptedBackend {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<FaceDetection>, InferError> {
            Ok(self.detection.iter().cloned().collect())
        }

        fn recognize(
            &mut self,
            _frame: &Frame,
            _face: &FaceDetection,
        ) -> Result<Embedding, InferError> {
            self.probes
                .pop_front()
                .ok_or_else(|| InferError::Recognize("no scripted probe".into()))
        }

        fn antispoof(&mut self, _frame: &Frame, _face_box: (f32, f32, f32, f32)) -> (bool, f32) {
            self.spoof.pop_front().unwrap_or(Self::live())
        }

        fn mesh(
            &mut self,
            _frame: &Frame,
            _face_box: (f32, f32, f32, f32),
        ) -> Result<Vec<MeshLandmark>, InferError> {
            if self.mesh.is_empty() {
                Err(InferError::Mesh("no scripted mesh".into()))
            } else {
                Ok(self.mesh.clone())
            }
        }
    }

    fn frontal_face() -> FaceDetection {
        FaceDetection {
            x: 200.0,
            y: 120.0,
            width: 160.0,
            height: 180.0,
            score: 0.95,
            landmarks: [
                (240.0, 180.0), // left eye
                (320.0, 180.0), // right eye
                (280.0, 219.6), // nose (neutral pose ratio)
                (250.0, 260.0), // left mouth
                (310.0, 260.0), // right mouth
            ],
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame {
            data: vec![90u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            timestamp: Instant::now(),
            sequence,
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Arc<Config>,
        blacklist: BlacklistManager,
        audit: AuditLog,
        seq: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::from_env();
            config.state_dir = dir.path().to_path_buf();
            config.log_dir = dir.path().join("logs");
            config.min_face_px = 50.0;
            let blacklist = BlacklistManager::open(dir.path()).unwrap();
            let audit = AuditLog::open(&dir.path().join("logs"), 30).unwrap();
            Self {
                _dir: dir,
                config: Arc::new(config),
                blacklist,
                audit,
                seq: 0,
            }
        }

        fn session(&self, target: Option<&str>, galleries: Vec<Gallery>) -> AuthSession {
            AuthSession::new(
                Arc::clone(&self.config),
                target.map(String::from),
                galleries,
            )
        }

        fn tick(&mut self, session: &mut AuthSession, backend: &mut ScriptedBackend) -> TickReport {
            self.seq += 1;
            session.tick(&frame(self.seq), backend, &mut self.blacklist, &self.audit)
        }
    }

    fn alex_gallery() -> Gallery {
        let mut g = Gallery::new("alex", false);
        for i in 0..20 {
            g.append_enrolled(axis_embedding(i));
        }
        g
    }

    #[test]
    fn test_standard_match_succeeds_without_challenge() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        backend.probes.push_back(embedding_at_distance(0.35));

        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Success);
        assert_eq!(report.tier, Some(MatchTier::Standard));
        assert_eq!(
            session.outcome(),
            Some(&AuthOutcome::Success {
                user: "alex".into(),
                tier: MatchTier::Standard
            })
        );
        assert!(session.take_pending_adapt().is_none(), "standard tier never adapts");
    }

    #[test]
    fn test_borderline_match_requires_2fa_with_user() {
        let mut fx = Fixture::new();
        let mut session = fx.session(None, vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        backend.probes.push_back(embedding_at_distance(0.46));

        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Require2fa);
        assert_eq!(report.matched_user.as_deref(), Some("alex"));
        assert!((report.distance.unwrap() - 0.46).abs() < 1e-3);
    }

    #[test]
    fn test_golden_match_enters_challenge_then_succeeds() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        backend.probes.push_back(embedding_at_distance(0.10));

        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Challenge, "golden tier must run the challenge");

        // Drive the pose stage: aim the nose at whichever direction was drawn.
        let mut posed = frontal_face();
        // Try all four extremes until the challenge advances past the pose.
        for (dx, dy) in [(30.0, 0.0), (-30.0, 0.0), (0.0, -14.0), (0.0, 16.0)] {
            posed.landmarks[2] = (280.0 + dx, 219.6 + dy);
            backend.detection = Some(posed.clone());
            fx.tick(&mut session, &mut backend);
        }

        // Blink: two closed-eye frames, then two open-eye frames.
        backend.detection = Some(frontal_face());
        backend.mesh = mesh_with_ears(0.10);
        fx.tick(&mut session, &mut backend);
        fx.tick(&mut session, &mut backend);
        backend.mesh = mesh_with_ears(0.30);
        fx.tick(&mut session, &mut backend);
        let report = fx.tick(&mut session, &mut backend);

        assert_eq!(report.state, PublicState::Success);
        assert_eq!(report.tier, Some(MatchTier::Golden));
        let adapt = session.take_pending_adapt().unwrap();
        assert_eq!(adapt.user, "alex");
    }

    #[test]
    fn test_spoof_budget_exhaustion_fails() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();

        for _ in 0..3 {
            backend.probes.push_back(embedding_at_distance(0.10));
            backend.spoof.push_back((false, 0.3));
        }

        let mut last = None;
        for _ in 0..3 {
            last = Some(fx.tick(&mut session, &mut backend));
        }
        let report = last.unwrap();
        assert_eq!(report.state, PublicState::Failure);
        assert_eq!(report.failure, Some(FailureKind::Spoof));
    }

    #[test]
    fn test_spoof_retry_reacquires_before_failing() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();

        backend.probes.push_back(embedding_at_distance(0.10));
        backend.spoof.push_back((false, 0.3));
        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Acquiring, "one spoof fail only retries");

        // Next tick is live and matches
        backend.probes.push_back(embedding_at_distance(0.35));
        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Success);
    }

    #[test]
    fn test_unknown_face_denied_and_quarantined() {
        let mut fx = Fixture::new();
        let mut session = fx.session(None, vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();

        for _ in 0..3 {
            backend.probes.push_back(axis_embedding(100));
        }

        let mut last = None;
        for _ in 0..3 {
            last = Some(fx.tick(&mut session, &mut backend));
        }
        let report = last.unwrap();
        assert_eq!(report.state, PublicState::Failure);
        assert_eq!(report.failure, Some(FailureKind::Denied));
        // Each failed attempt quarantined the exact probe
        assert_eq!(fx.blacklist.entries().len(), 3);
    }

    #[test]
    fn test_blacklisted_face_blocked_before_spoofcheck() {
        let mut fx = Fixture::new();
        let intruder = axis_embedding(100);
        fx.blacklist.record_intrusion(&intruder, b"jpg").unwrap();

        let mut session = fx.session(None, vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        backend.probes.push_back(intruder);
        // Spoof verdict would be "fake" — but PREMATCH must fire first
        backend.spoof.push_back((false, 0.1));

        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Failure);
        assert_eq!(report.failure, Some(FailureKind::BlockedIntruder));
        // The spoof verdict was never consumed
        assert_eq!(backend.spoof.len(), 1);
    }

    #[test]
    fn test_global_timeout() {
        let mut fx = Fixture::new();
        let mut config = (*fx.config).clone();
        config.global_session_timeout_secs = 0.0;
        fx.config = Arc::new(config);

        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Failure);
        assert_eq!(report.failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn test_stale_frames_are_ignored() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        backend.probes.push_back(embedding_at_distance(0.35));

        fx.seq = 10;
        let report = session.tick(&frame(10), &mut backend, &mut fx.blacklist, &fx.audit);
        assert_eq!(report.state, PublicState::Success);

        // Replaying an older frame after terminal changes nothing
        let report = session.tick(&frame(5), &mut backend, &mut fx.blacklist, &fx.audit);
        assert_eq!(report.state, PublicState::Success);
    }

    #[test]
    fn test_inference_error_budget_degrades_to_internal() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        let mut backend = ScriptedBackend::new();
        // No scripted probes: every recognize call errors

        let mut last = None;
        for _ in 0..INFER_ERROR_BUDGET {
            last = Some(fx.tick(&mut session, &mut backend));
        }
        let report = last.unwrap();
        assert_eq!(report.state, PublicState::Failure);
        assert_eq!(report.failure, Some(FailureKind::Internal));
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut fx = Fixture::new();
        let mut session = fx.session(Some("alex"), vec![alex_gallery()]);
        session.cancel(&fx.audit);
        assert_eq!(
            session.outcome(),
            Some(&AuthOutcome::Failure(FailureKind::Cancelled))
        );

        // Ticking a cancelled session is inert
        let mut backend = ScriptedBackend::new();
        let report = fx.tick(&mut session, &mut backend);
        assert_eq!(report.state, PublicState::Failure);
    }

    fn mesh_with_ears(ear: f32) -> Vec<MeshLandmark> {
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
}
