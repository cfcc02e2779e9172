//! The engine thread: exclusive owner of models, camera, and sessions.
//!
//! All inference and all session state live on one dedicated OS thread;
//! RPC handlers talk to it through an mpsc request channel with oneshot
//! replies. That single thread is what enforces the concurrency contract:
//! at most one authentication or enrollment session exists, the camera has
//! exactly one owner, and two sessions can never run inference
//! concurrently. Handles fail fast with `Busy` while a session is active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use sentinel_core::{
    DetectorConfig, Embedding, FaceDetection, FaceDetector, FaceMesh, FaceRecognizer, MatchTier,
    MeshLandmark, SpoofDetector, StabilityTracker, TrackerConfig,
};
use sentinel_hw::{CameraConfig, CameraError, CameraStream, Frame};

use crate::adaptive::{AdaptiveManager, AdaptiveSettings};
use crate::audit::{AuditLog, AuditRecord};
use crate::authenticator::{
    AuthOutcome, AuthSession, FailureKind, InferError, InferenceBackend, TickReport,
};
use crate::blacklist::BlacklistManager;
use crate::config::Config;
use crate::enrollment::{EnrollSession, EnrollStatus};
use crate::gallery::{Gallery, GalleryStore, StoreError};

/// Longest wait for one fresh camera frame inside blocking loops.
const FRESH_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("BUSY")]
    Busy,
    #[error("engine not initialized")]
    NotInitialized,
    #[error("no active session")]
    NoSession,
    #[error("no frame available")]
    NoFrame,
    #[error("BIOMETRICS_EXPIRED")]
    BiometricsExpired,
    #[error("user '{0}' is not enrolled")]
    Unenrolled(String),
    #[error("user '{0}' is already enrolled")]
    AlreadyEnrolled(String),
    #[error("no enrolled users found")]
    NoEnrolledUsers,
    #[error("capture not ready: {0}")]
    CaptureNotReady(String),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("model: {0}")]
    Model(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Stable error code surfaced to RPC clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy => "BUSY",
            Self::BiometricsExpired => "BIOMETRICS_EXPIRED",
            Self::Unenrolled(_) => "UNENROLLED_USER",
            Self::AlreadyEnrolled(_) => "ALREADY_ENROLLED",
            Self::NoEnrolledUsers => "NO_ENROLLED_USERS",
            Self::NoFrame => "NO_FRAME",
            Self::Camera(_) => "NO_CAMERA",
            Self::CaptureNotReady(_) => "CAPTURE_NOT_READY",
            Self::NotInitialized | Self::NoSession | Self::Store(_) | Self::Model(_)
            | Self::ChannelClosed => "INTERNAL",
        }
    }
}

/// ONNX-backed perception, one session per model.
pub struct OnnxBackend {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    spoof: SpoofDetector,
    mesh: FaceMesh,
}

impl OnnxBackend {
    pub fn load(config: &Config) -> Result<Self, EngineError> {
        sentinel_models::verify_models_dir(&config.model_dir)
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let detector = FaceDetector::load(
            &config.detector_model_path(),
            DetectorConfig {
                score_min: config.det_score_min,
                nms_threshold: config.nms_threshold,
                min_face_px: config.min_face_px,
                max_faces: config.max_faces,
            },
        )
        .map_err(|e| EngineError::Model(e.to_string()))?;

        let recognizer = FaceRecognizer::load(&config.recognizer_model_path())
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let spoof = SpoofDetector::load(
            &config.spoof_model_path(),
            &config.spoof_calibration_path(),
            config.spoof_threshold,
        )
        .map_err(|e| EngineError::Model(e.to_string()))?;

        let mesh = FaceMesh::load(&config.mesh_model_path())
            .map_err(|e| EngineError::Model(e.to_string()))?;

        info!("all perception models loaded");
        Ok(Self {
            detector,
            recognizer,
            spoof,
            mesh,
        })
    }

    fn spoof_is_calibrating(&self) -> bool {
        self.spoof.is_calibrating()
    }

    fn spoof_calibrate_tick(&mut self, frame: &Frame, face_box: (f32, f32, f32, f32)) {
        self.spoof
            .calibrate_tick(&frame.data, frame.width, frame.height, face_box);
    }
}

impl InferenceBackend for OnnxBackend {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, InferError> {
        self.detector
            .detect(&frame.data, frame.width, frame.height)
            .map_err(|e| InferError::Detect(e.to_string()))
    }

    fn recognize(&mut self, frame: &Frame, face: &FaceDetection) -> Result<Embedding, InferError> {
        self.recognizer
            .extract(&frame.data, frame.width, frame.height, face)
            .map_err(|e| InferError::Recognize(e.to_string()))
    }

    fn antispoof(&mut self, frame: &Frame, face_box: (f32, f32, f32, f32)) -> (bool, f32) {
        self.spoof
            .is_live(&frame.data, frame.width, frame.height, face_box)
    }

    fn mesh(
        &mut self,
        frame: &Frame,
        face_box: (f32, f32, f32, f32),
    ) -> Result<Vec<MeshLandmark>, InferError> {
        self.mesh
            .detect(&frame.data, frame.width, frame.height, face_box)
            .map_err(|e| InferError::Mesh(e.to_string()))
    }
}

/// Reply to one `process_auth_frame` tick.
pub struct AuthFrameReply {
    pub report: TickReport,
    pub frame_jpeg: Vec<u8>,
}

/// Reply to one `process_enroll_frame` poll.
pub struct EnrollFrameReply {
    pub status: EnrollStatus,
    pub current_pose: usize,
    pub total_poses: usize,
    pub pose_name: &'static str,
    pub pose_instruction: &'static str,
    pub face_box: Option<(f32, f32, f32, f32)>,
    pub frame_jpeg: Vec<u8>,
    pub completed: bool,
}

/// Reply to `capture_enroll_pose`.
pub struct CaptureReply {
    pub completed: bool,
    pub current_pose: usize,
    pub pose_name: Option<&'static str>,
    pub pose_instruction: Option<&'static str>,
}

enum EngineRequest {
    Initialize {
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    UpdateConfig {
        config: Arc<Config>,
        reply: oneshot::Sender<()>,
    },
    GetEnrolledUsers {
        reply: oneshot::Sender<Vec<String>>,
    },
    StartAuth {
        target_user: Option<String>,
        adapt_token: Option<String>,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    AuthFrame {
        reply: oneshot::Sender<Result<AuthFrameReply, EngineError>>,
    },
    StopAuth {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    AuthenticatePam {
        target_user: Option<String>,
        reply: oneshot::Sender<Result<&'static str, EngineError>>,
    },
    StartEnroll {
        user: String,
        wears_glasses: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    EnrollFrame {
        reply: oneshot::Sender<Result<EnrollFrameReply, EngineError>>,
    },
    CapturePose {
        reply: oneshot::Sender<Result<CaptureReply, EngineError>>,
    },
    StopEnroll {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    GetIntrusions {
        reply: oneshot::Sender<Vec<String>>,
    },
    ConfirmIntrusion {
        id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    DeleteIntrusion {
        id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    session_active: Arc<AtomicBool>,
}

macro_rules! roundtrip {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* }) => {{
        let (reply_tx, reply_rx) = oneshot::channel();
        $self
            .tx
            .send(EngineRequest::$variant { $($field: $value,)* reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }};
}

impl EngineHandle {
    pub async fn initialize(&self) -> Result<bool, EngineError> {
        roundtrip!(self, Initialize {})?
    }

    pub async fn update_config(&self, config: Arc<Config>) -> Result<(), EngineError> {
        roundtrip!(self, UpdateConfig { config: config })
    }

    pub async fn get_enrolled_users(&self) -> Result<Vec<String>, EngineError> {
        roundtrip!(self, GetEnrolledUsers {})
    }

    pub async fn start_authentication(
        &self,
        target_user: Option<String>,
        adapt_token: Option<String>,
    ) -> Result<Vec<String>, EngineError> {
        if self.session_active.load(Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        roundtrip!(self, StartAuth { target_user: target_user, adapt_token: adapt_token })?
    }

    pub async fn process_auth_frame(&self) -> Result<AuthFrameReply, EngineError> {
        roundtrip!(self, AuthFrame {})?
    }

    pub async fn stop_authentication(&self) -> Result<(), EngineError> {
        roundtrip!(self, StopAuth {})?
    }

    pub async fn authenticate_pam(
        &self,
        target_user: Option<String>,
    ) -> Result<&'static str, EngineError> {
        if self.session_active.load(Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        roundtrip!(self, AuthenticatePam { target_user: target_user })?
    }

    pub async fn start_enrollment(
        &self,
        user: String,
        wears_glasses: bool,
    ) -> Result<(), EngineError> {
        if self.session_active.load(Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        roundtrip!(self, StartEnroll { user: user, wears_glasses: wears_glasses })?
    }

    pub async fn process_enroll_frame(&self) -> Result<EnrollFrameReply, EngineError> {
        roundtrip!(self, EnrollFrame {})?
    }

    pub async fn capture_enroll_pose(&self) -> Result<CaptureReply, EngineError> {
        roundtrip!(self, CapturePose {})?
    }

    pub async fn stop_enrollment(&self) -> Result<(), EngineError> {
        roundtrip!(self, StopEnroll {})?
    }

    pub async fn get_intrusions(&self) -> Result<Vec<String>, EngineError> {
        roundtrip!(self, GetIntrusions {})
    }

    pub async fn confirm_intrusion(&self, id: String) -> Result<bool, EngineError> {
        roundtrip!(self, ConfirmIntrusion { id: id })?
    }

    pub async fn delete_intrusion(&self, id: String) -> Result<bool, EngineError> {
        roundtrip!(self, DeleteIntrusion { id: id })?
    }
}

enum ActiveSession {
    Auth {
        session: AuthSession,
        camera: CameraStream,
        adapt_token: Option<String>,
    },
    Enroll {
        session: EnrollSession,
        tracker: StabilityTracker,
        camera: CameraStream,
        last_sequence: u64,
    },
}

struct Engine {
    config: Arc<Config>,
    backend: Option<OnnxBackend>,
    loaded_digest: Option<String>,
    gallery_store: GalleryStore,
    blacklist: BlacklistManager,
    adaptive: AdaptiveManager,
    audit: AuditLog,
    active: Option<ActiveSession>,
    session_active: Arc<AtomicBool>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Stores open synchronously (fail-fast); models load lazily on the first
/// `initialize` so daemon startup stays cheap.
pub fn spawn_engine(config: Arc<Config>) -> Result<EngineHandle, EngineError> {
    let gallery_store = GalleryStore::new(&config.state_dir)?;
    let blacklist = BlacklistManager::open(&config.state_dir)?;
    let adaptive = AdaptiveManager::new(&config.state_dir)
        .map_err(|e| EngineError::Model(e.to_string()))?;
    let audit = AuditLog::open(&config.log_dir, config.log_retention_days)
        .map_err(|e| EngineError::Model(e.to_string()))?;

    let session_active = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let mut engine = Engine {
        config,
        backend: None,
        loaded_digest: None,
        gallery_store,
        blacklist,
        adaptive,
        audit,
        active: None,
        session_active: Arc::clone(&session_active),
    };

    std::thread::Builder::new()
        .name("sentinel-engine".into())
        .spawn(move || {
            info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                engine.handle(request);
            }
            engine.release_session();
            info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Model(format!("failed to spawn engine thread: {e}")))?;

    Ok(EngineHandle { tx, session_active })
}

impl Engine {
    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Initialize { reply } => {
                let _ = reply.send(self.initialize());
            }
            EngineRequest::UpdateConfig { config, reply } => {
                info!("engine adopted new config snapshot");
                self.config = config;
                let _ = reply.send(());
            }
            EngineRequest::GetEnrolledUsers { reply } => {
                let _ = reply.send(self.enrolled_users());
            }
            EngineRequest::StartAuth {
                target_user,
                adapt_token,
                reply,
            } => {
                let _ = reply.send(self.start_auth(target_user, adapt_token));
            }
            EngineRequest::AuthFrame { reply } => {
                let _ = reply.send(self.auth_frame());
            }
            EngineRequest::StopAuth { reply } => {
                let _ = reply.send(self.stop_auth());
            }
            EngineRequest::AuthenticatePam { target_user, reply } => {
                let _ = reply.send(self.authenticate_pam(target_user));
            }
            EngineRequest::StartEnroll {
                user,
                wears_glasses,
                reply,
            } => {
                let _ = reply.send(self.start_enroll(&user, wears_glasses));
            }
            EngineRequest::EnrollFrame { reply } => {
                let _ = reply.send(self.enroll_frame());
            }
            EngineRequest::CapturePose { reply } => {
                let _ = reply.send(self.capture_pose());
            }
            EngineRequest::StopEnroll { reply } => {
                let _ = reply.send(self.stop_enroll());
            }
            EngineRequest::GetIntrusions { reply } => {
                let _ = reply.send(self.blacklist.quarantine_files());
            }
            EngineRequest::ConfirmIntrusion { id, reply } => {
                let _ = reply.send(self.blacklist.confirm(&id).map_err(EngineError::from));
            }
            EngineRequest::DeleteIntrusion { id, reply } => {
                let _ = reply.send(self.blacklist.delete(&id).map_err(EngineError::from));
            }
        }
    }

    /// Load (or re-load) models. Returns true when models were already warm
    /// for the current config digest.
    fn initialize(&mut self) -> Result<bool, EngineError> {
        let digest = self.config.digest();
        if self.backend.is_some() && self.loaded_digest.as_deref() == Some(digest.as_str()) {
            return Ok(true);
        }

        let backend = OnnxBackend::load(&self.config)?;
        self.backend = Some(backend);
        self.loaded_digest = Some(digest);
        Ok(false)
    }

    fn enrolled_users(&self) -> Vec<String> {
        let now = Utc::now();
        self.gallery_store
            .load_all()
            .into_iter()
            .filter(|g| g.is_usable(self.config.min_enrolled(), self.config.max_age_days, now))
            .map(|g| g.user)
            .collect()
    }

    /// Validate and load the galleries for a session.
    fn session_galleries(&self, target_user: &Option<String>) -> Result<Vec<Gallery>, EngineError> {
        let now = Utc::now();
        let min_enrolled = self.config.min_enrolled();
        let max_age = self.config.max_age_days;

        match target_user {
            Some(user) => {
                let gallery = self
                    .gallery_store
                    .load(user)
                    .ok_or_else(|| EngineError::Unenrolled(user.clone()))?;
                if gallery.is_expired(max_age, now) {
                    return Err(EngineError::BiometricsExpired);
                }
                if gallery.segment_boundary < min_enrolled {
                    return Err(EngineError::Unenrolled(user.clone()));
                }
                Ok(vec![gallery])
            }
            None => {
                let galleries: Vec<Gallery> = self
                    .gallery_store
                    .load_all()
                    .into_iter()
                    .filter(|g| g.is_usable(min_enrolled, max_age, now))
                    .collect();
                if galleries.is_empty() {
                    return Err(EngineError::NoEnrolledUsers);
                }
                Ok(galleries)
            }
        }
    }

    fn open_camera(&self) -> Result<CameraStream, EngineError> {
        let mut camera = CameraStream::new(CameraConfig {
            device_id: self.config.camera_device_id,
            width: self.config.camera_width,
            height: self.config.camera_height,
            fps: self.config.camera_fps,
            warmup_ms: self.config.camera_warmup_ms,
        });
        camera.start()?;
        Ok(camera)
    }

    fn start_auth(
        &mut self,
        target_user: Option<String>,
        adapt_token: Option<String>,
    ) -> Result<Vec<String>, EngineError> {
        if self.active.is_some() {
            return Err(EngineError::Busy);
        }
        if self.backend.is_none() {
            self.initialize()?;
        }

        let galleries = self.session_galleries(&target_user)?;
        let users: Vec<String> = galleries.iter().map(|g| g.user.clone()).collect();
        let camera = self.open_camera()?;

        info!(target = ?target_user, users = users.len(), "authentication session started");
        self.active = Some(ActiveSession::Auth {
            session: AuthSession::new(Arc::clone(&self.config), target_user, galleries),
            camera,
            adapt_token,
        });
        self.session_active.store(true, Ordering::SeqCst);
        Ok(users)
    }

    fn auth_frame(&mut self) -> Result<AuthFrameReply, EngineError> {
        let backend = self.backend.as_mut().ok_or(EngineError::NotInitialized)?;
        let Some(ActiveSession::Auth {
            session, camera, ..
        }) = self.active.as_mut()
        else {
            return Err(EngineError::NoSession);
        };

        let frame = camera.read()?.ok_or(EngineError::NoFrame)?;
        let report = session.tick(&frame, backend, &mut self.blacklist, &self.audit);
        let frame_jpeg = sentinel_hw::frame::encode_jpeg(&frame, 70).unwrap_or_default();

        if session.is_terminal() {
            self.finish_auth_session();
        }

        Ok(AuthFrameReply { report, frame_jpeg })
    }

    fn stop_auth(&mut self) -> Result<(), EngineError> {
        if let Some(ActiveSession::Auth { session, .. }) = self.active.as_mut() {
            session.cancel(&self.audit);
            self.finish_auth_session();
            Ok(())
        } else {
            Err(EngineError::NoSession)
        }
    }

    /// Tear down a terminal auth session: commit any queued adaptation,
    /// release the camera, clear the busy flag.
    fn finish_auth_session(&mut self) {
        let Some(ActiveSession::Auth {
            mut session,
            mut camera,
            adapt_token,
        }) = self.active.take()
        else {
            return;
        };

        if let Some(AuthOutcome::Success {
            tier: MatchTier::Golden,
            ..
        }) = session.outcome()
        {
            if let Some(pending) = session.take_pending_adapt() {
                self.commit_adaptation(&pending.user, &pending.embedding, adapt_token.is_some());
            }
        }

        camera.stop();
        self.session_active.store(false, Ordering::SeqCst);
    }

    fn commit_adaptation(&mut self, user: &str, probe: &Embedding, password_confirmed: bool) {
        let Some(mut gallery) = self.gallery_store.load(user) else {
            warn!(user, "adaptation skipped: gallery vanished");
            return;
        };

        let settings = AdaptiveSettings {
            limit_per_day: self.config.adaptation_limit_per_day,
            initial_require_password: self.config.initial_adaptations_require_password,
            min_diversity: self.config.min_adaptive_diversity,
            max_distance: self.config.max_adaptive_distance,
        };
        let today = Utc::now().date_naive();

        match self
            .adaptive
            .evaluate(&gallery, probe, &settings, password_confirmed, today)
        {
            Ok(()) => {
                gallery.append_adaptive(probe.clone(), self.config.max_adaptive);
                match self.gallery_store.save(&gallery) {
                    Ok(()) => {
                        if let Err(e) = self.adaptive.record_commit(user, today) {
                            warn!(user, error = %e, "adaptive ledger write failed");
                        }
                        self.audit.record(&AuditRecord {
                            status: "ADAPT",
                            message: "Golden login, probe committed to adaptive segment",
                            user: Some(user),
                            ..AuditRecord::default()
                        });
                        info!(user, "adaptive gallery updated");
                    }
                    Err(e) => error!(user, error = %e, "adaptive gallery save failed"),
                }
            }
            Err(skip) => {
                info!(user, reason = ?skip, "adaptation skipped by policy");
            }
        }
    }

    /// Blocking end-to-end authentication for the PAM shim.
    fn authenticate_pam(&mut self, target_user: Option<String>) -> Result<&'static str, EngineError> {
        self.start_auth(target_user, None)?;
        let deadline = Instant::now()
            + Duration::from_secs_f64(self.config.global_session_timeout_secs);

        let result = loop {
            if Instant::now() > deadline {
                break "TIMEOUT";
            }

            match self.auth_frame() {
                Ok(reply) => {
                    if let Some(outcome) = outcome_of(&reply.report) {
                        break outcome;
                    }
                }
                Err(EngineError::NoFrame) => {}
                Err(EngineError::NoSession) => break "FAILURE",
                Err(e) => {
                    warn!(error = %e, "pam tick failed");
                    break "FAILURE";
                }
            }
            std::thread::sleep(Duration::from_millis(30));
        };

        // Timeout path may leave the session running
        if self.active.is_some() {
            let _ = self.stop_auth();
        }
        info!(result, "pam authentication finished");
        Ok(result)
    }

    fn start_enroll(&mut self, user: &str, wears_glasses: bool) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::Busy);
        }
        if self.backend.is_none() {
            self.initialize()?;
        }
        if self.gallery_store.load(user).is_some() {
            return Err(EngineError::AlreadyEnrolled(user.to_string()));
        }

        let camera = self.open_camera()?;
        let tracker = StabilityTracker::new(TrackerConfig {
            iou_reassoc: self.config.iou_reassoc,
            max_lost_frames: self.config.max_lost_frames,
            min_face_px: self.config.min_face_px,
            dt: 1.0 / f64::from(self.config.camera_fps.max(1)),
        });

        info!(user, wears_glasses, "enrollment session started");
        self.active = Some(ActiveSession::Enroll {
            session: EnrollSession::new(user, wears_glasses, self.config.samples_per_pose),
            tracker,
            camera,
            last_sequence: 0,
        });
        self.session_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn enroll_frame(&mut self) -> Result<EnrollFrameReply, EngineError> {
        let backend = self.backend.as_mut().ok_or(EngineError::NotInitialized)?;
        let Some(ActiveSession::Enroll {
            session,
            tracker,
            camera,
            last_sequence,
        }) = self.active.as_mut()
        else {
            return Err(EngineError::NoSession);
        };

        let frame = camera.read()?.ok_or(EngineError::NoFrame)?;
        let fresh = frame.sequence > *last_sequence;
        *last_sequence = frame.sequence;

        let mut enhanced = frame.clone();
        sentinel_hw::frame::clahe_enhance(&mut enhanced, 8, 0.02);
        let detections = backend
            .detect(&enhanced)
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let target = if fresh { tracker.update(&detections) } else { None };
        let status = session.assess(
            &detections,
            tracker.is_stable(5.0),
            self.config.min_face_px,
            self.config.head_angle_threshold,
        );

        // Enrollment frames with a locked single face are known live: feed
        // the spoof auto-calibration until it settles.
        if let (Some(target), true) = (&target, backend.spoof_is_calibrating()) {
            if detections.len() == 1 {
                backend.spoof_calibrate_tick(&frame, target.smoothed_box);
            }
        }

        let pose = session.current_pose();
        Ok(EnrollFrameReply {
            status,
            current_pose: session.current_pose_index(),
            total_poses: session.total_poses(),
            pose_name: pose.map(|p| p.name()).unwrap_or("DONE"),
            pose_instruction: pose.map(|p| p.instruction()).unwrap_or("Enrollment complete"),
            face_box: target.map(|t| t.smoothed_box),
            frame_jpeg: sentinel_hw::frame::encode_jpeg(&frame, 70).unwrap_or_default(),
            completed: session.is_complete(),
        })
    }

    /// Capture `samples_per_pose` embeddings for the current pose, one per
    /// fresh frame, then advance.
    fn capture_pose(&mut self) -> Result<CaptureReply, EngineError> {
        let backend = self.backend.as_mut().ok_or(EngineError::NotInitialized)?;
        let Some(ActiveSession::Enroll {
            session,
            camera,
            last_sequence,
            ..
        }) = self.active.as_mut()
        else {
            return Err(EngineError::NoSession);
        };

        let needed = session.samples_remaining();
        for _ in 0..needed {
            let frame = wait_fresh_frame(camera, last_sequence)?;

            let mut enhanced = frame.clone();
            sentinel_hw::frame::clahe_enhance(&mut enhanced, 8, 0.02);
            let detections = backend
                .detect(&enhanced)
                .map_err(|e| EngineError::Model(e.to_string()))?;

            let face = match detections.as_slice() {
                [face] => face.clone(),
                [] => return Err(EngineError::CaptureNotReady("no face".into())),
                _ => return Err(EngineError::CaptureNotReady("multiple faces".into())),
            };

            let embedding = backend
                .recognize(&frame, &face)
                .map_err(|e| EngineError::Model(e.to_string()))?;
            session.record_sample(embedding);
        }

        if session.is_complete() {
            let user = session.user().to_string();
            let Some(ActiveSession::Enroll { session, .. }) = self.active.take() else {
                unreachable!("enroll session checked above");
            };
            let gallery = session.finish();
            self.gallery_store.save(&gallery)?;
            self.audit.record(&AuditRecord {
                status: "ENROLLED",
                message: "Enrollment saved",
                user: Some(&user),
                ..AuditRecord::default()
            });
            info!(user = %user, embeddings = gallery.embeddings.len(), "enrollment saved");
            self.release_session();
            return Ok(CaptureReply {
                completed: true,
                current_pose: POSE_COUNT,
                pose_name: None,
                pose_instruction: None,
            });
        }

        let pose = session.current_pose();
        Ok(CaptureReply {
            completed: false,
            current_pose: session.current_pose_index(),
            pose_name: pose.map(|p| p.name()),
            pose_instruction: pose.map(|p| p.instruction()),
        })
    }

    fn stop_enroll(&mut self) -> Result<(), EngineError> {
        match self.active {
            Some(ActiveSession::Enroll { .. }) => {
                info!("enrollment session discarded");
                self.release_session();
                Ok(())
            }
            _ => Err(EngineError::NoSession),
        }
    }

    /// Drop whatever session is active and release its camera.
    fn release_session(&mut self) {
        match self.active.take() {
            Some(ActiveSession::Auth { mut camera, .. })
            | Some(ActiveSession::Enroll { mut camera, .. }) => camera.stop(),
            None => {}
        }
        self.session_active.store(false, Ordering::SeqCst);
    }
}

const POSE_COUNT: usize = crate::enrollment::POSE_SEQUENCE.len();

/// Block until the camera delivers a frame newer than `last_sequence`.
fn wait_fresh_frame(
    camera: &CameraStream,
    last_sequence: &mut u64,
) -> Result<Frame, EngineError> {
    let deadline = Instant::now() + FRESH_FRAME_TIMEOUT;
    loop {
        if let Some(frame) = camera.read()? {
            if frame.sequence > *last_sequence {
                *last_sequence = frame.sequence;
                return Ok(frame);
            }
        }
        if Instant::now() > deadline {
            return Err(EngineError::NoFrame);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Map a terminal tick report to the PAM result string.
fn outcome_of(report: &TickReport) -> Option<&'static str> {
    use crate::authenticator::PublicState;

    match report.state {
        PublicState::Success => Some("SUCCESS"),
        PublicState::Require2fa => Some("REQUIRE_2FA"),
        PublicState::Failure => Some(match report.failure {
            Some(FailureKind::BlockedIntruder) => "BLOCKED_INTRUDER",
            Some(FailureKind::Timeout) => "TIMEOUT",
            Some(FailureKind::Denied) => "LOCKOUT",
            _ => "FAILURE",
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::PublicState;

    fn report(state: PublicState, failure: Option<FailureKind>) -> TickReport {
        TickReport {
            state,
            message: String::new(),
            face_box: None,
            matched_user: None,
            distance: None,
            tier: None,
            failure,
        }
    }

    #[test]
    fn test_pam_outcome_mapping() {
        assert_eq!(outcome_of(&report(PublicState::Acquiring, None)), None);
        assert_eq!(outcome_of(&report(PublicState::Challenge, None)), None);
        assert_eq!(
            outcome_of(&report(PublicState::Success, None)),
            Some("SUCCESS")
        );
        assert_eq!(
            outcome_of(&report(PublicState::Require2fa, None)),
            Some("REQUIRE_2FA")
        );
        assert_eq!(
            outcome_of(&report(PublicState::Failure, Some(FailureKind::BlockedIntruder))),
            Some("BLOCKED_INTRUDER")
        );
        assert_eq!(
            outcome_of(&report(PublicState::Failure, Some(FailureKind::Timeout))),
            Some("TIMEOUT")
        );
        assert_eq!(
            outcome_of(&report(PublicState::Failure, Some(FailureKind::Denied))),
            Some("LOCKOUT")
        );
        assert_eq!(
            outcome_of(&report(PublicState::Failure, Some(FailureKind::Spoof))),
            Some("FAILURE")
        );
    }

    #[test]
    fn test_engine_error_codes() {
        assert_eq!(EngineError::Busy.code(), "BUSY");
        assert_eq!(EngineError::BiometricsExpired.code(), "BIOMETRICS_EXPIRED");
        assert_eq!(EngineError::Unenrolled("x".into()).code(), "UNENROLLED_USER");
        assert_eq!(EngineError::NoFrame.code(), "NO_FRAME");
    }
}
