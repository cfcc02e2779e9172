//! The request dispatcher: RPC methods over the engine.
//!
//! Owns the published config snapshot and the mapping between client
//! connections and the session they started, and translates engine
//! results into the `{success, ...}` result objects of the wire protocol.
//! Application failures stay inside `result`; only malformed requests
//! become JSON-RPC errors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::authenticator::tier_str;
use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::rpc::DispatchError;

pub struct SentinelService {
    config: RwLock<Arc<Config>>,
    engine: EngineHandle,
    warmed: AtomicBool,
    /// Connection that owns the active session, if any.
    session_owner: Mutex<Option<u64>>,
}

impl SentinelService {
    pub fn new(config: Arc<Config>, engine: EngineHandle) -> Self {
        Self {
            config: RwLock::new(config),
            engine,
            warmed: AtomicBool::new(false),
            session_owner: Mutex::new(None),
        }
    }

    /// Route one RPC method call.
    pub async fn dispatch(
        &self,
        conn_id: u64,
        method: &str,
        params: Value,
    ) -> Result<Value, DispatchError> {
        match method {
            "status" => Ok(self.status()),
            "initialize" => Ok(self.initialize().await),
            "get_config" => Ok(self.get_config().await),
            "update_config" => Ok(self.update_config(&params).await),
            "get_enrolled_users" => Ok(self.get_enrolled_users().await),
            "start_authentication" => Ok(self.start_authentication(conn_id, &params).await),
            "process_auth_frame" => Ok(self.process_auth_frame().await),
            "stop_authentication" => Ok(self.stop_authentication().await),
            "authenticate_pam" => Ok(self.authenticate_pam(&params).await),
            "start_enrollment" => Ok(self.start_enrollment(conn_id, &params).await),
            "process_enroll_frame" => Ok(self.process_enroll_frame().await),
            "capture_enroll_pose" => Ok(self.capture_enroll_pose().await),
            "stop_enrollment" => Ok(self.stop_enrollment().await),
            "get_intrusions" => Ok(self.get_intrusions().await),
            "confirm_intrusion" => Ok(self.confirm_intrusion(&params).await),
            "delete_intrusion" => Ok(self.delete_intrusion(&params).await),
            _ => Err(DispatchError::MethodNotFound),
        }
    }

    /// Cancel whatever session this connection started.
    pub async fn handle_disconnect(&self, conn_id: u64) {
        let mut owner = self.session_owner.lock().await;
        if *owner != Some(conn_id) {
            return;
        }
        *owner = None;
        drop(owner);

        info!(conn_id, "client disconnected mid-session; cancelling");
        if self.engine.stop_authentication().await.is_err() {
            let _ = self.engine.stop_enrollment().await;
        }
    }

    fn status(&self) -> Value {
        json!({
            "success": true,
            "warmed": self.warmed.load(Ordering::SeqCst),
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    async fn initialize(&self) -> Value {
        match self.engine.initialize().await {
            Ok(already_warm) => {
                self.warmed.store(true, Ordering::SeqCst);
                json!({ "success": true, "already": already_warm })
            }
            Err(e) => failure(&e),
        }
    }

    async fn get_config(&self) -> Value {
        let config = self.config.read().await;
        json!({ "success": true, "config": map_to_object(config.to_map()) })
    }

    /// Atomic snapshot swap: validate the whole batch, publish the new
    /// `Arc`, hand it to the engine. No partial apply.
    async fn update_config(&self, params: &Value) -> Value {
        let Some(updates) = params.get("config").and_then(Value::as_object) else {
            return json!({ "success": false, "error": "missing 'config' object" });
        };
        let updates: BTreeMap<String, Value> = updates
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut published = self.config.write().await;
        match published.with_updates(&updates) {
            Ok(next) => {
                let next = Arc::new(next);
                *published = Arc::clone(&next);
                drop(published);

                if let Err(e) = self.engine.update_config(Arc::clone(&next)).await {
                    warn!(error = %e, "engine did not adopt new config");
                }
                info!(keys = updates.len(), "config snapshot swapped");
                json!({ "success": true, "config": map_to_object(next.to_map()) })
            }
            Err(e) => json!({ "success": false, "error": e.to_string() }),
        }
    }

    async fn get_enrolled_users(&self) -> Value {
        match self.engine.get_enrolled_users().await {
            Ok(users) => json!({ "success": true, "users": users }),
            Err(e) => failure(&e),
        }
    }

    async fn start_authentication(&self, conn_id: u64, params: &Value) -> Value {
        let target_user = params.get("user").and_then(Value::as_str).map(String::from);
        let adapt_token = params
            .get("adapt_token")
            .and_then(Value::as_str)
            .map(String::from);

        match self
            .engine
            .start_authentication(target_user.clone(), adapt_token)
            .await
        {
            Ok(users) => {
                *self.session_owner.lock().await = Some(conn_id);
                json!({ "success": true, "users": users, "target_user": target_user })
            }
            Err(e) => failure(&e),
        }
    }

    async fn process_auth_frame(&self) -> Value {
        match self.engine.process_auth_frame().await {
            Ok(reply) => {
                if reply.report.failure.is_some()
                    || matches!(
                        reply.report.state,
                        crate::authenticator::PublicState::Success
                            | crate::authenticator::PublicState::Require2fa
                    )
                {
                    *self.session_owner.lock().await = None;
                }

                let mut info = Map::new();
                if let Some(user) = &reply.report.matched_user {
                    info.insert("user".into(), json!(user));
                }
                if let Some(dist) = reply.report.distance {
                    info.insert("dist".into(), json!(dist));
                }
                if let Some(tier) = reply.report.tier {
                    info.insert("tier".into(), json!(tier_str(tier)));
                }
                if let Some(kind) = reply.report.failure {
                    info.insert("kind".into(), json!(kind.as_str()));
                }

                json!({
                    "success": true,
                    "state": reply.report.state,
                    "message": reply.report.message,
                    "face_box": reply.report.face_box.map(box_to_array),
                    "info": info,
                    "frame": base64::engine::general_purpose::STANDARD.encode(&reply.frame_jpeg),
                })
            }
            Err(e) => failure(&e),
        }
    }

    async fn stop_authentication(&self) -> Value {
        *self.session_owner.lock().await = None;
        match self.engine.stop_authentication().await {
            // Stopping an already-finished session is not an error
            Ok(()) | Err(EngineError::NoSession) => json!({ "success": true }),
            Err(e) => failure(&e),
        }
    }

    async fn authenticate_pam(&self, params: &Value) -> Value {
        let target_user = params.get("user").and_then(Value::as_str).map(String::from);
        match self.engine.authenticate_pam(target_user).await {
            Ok(result) => json!({ "success": true, "result": result }),
            Err(EngineError::Busy) => failure(&EngineError::Busy),
            Err(e) => {
                // PAM callers need a definitive answer, not an error branch.
                warn!(error = %e, "pam authentication errored");
                json!({ "success": true, "result": "FAILURE" })
            }
        }
    }

    async fn start_enrollment(&self, conn_id: u64, params: &Value) -> Value {
        let Some(user) = params.get("user_name").and_then(Value::as_str) else {
            return json!({ "success": false, "error": "user_name required" });
        };
        let user = user.trim().to_lowercase();
        if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return json!({ "success": false, "error": "invalid user name" });
        }
        let wears_glasses = params
            .get("wears_glasses")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match self.engine.start_enrollment(user.clone(), wears_glasses).await {
            Ok(()) => {
                *self.session_owner.lock().await = Some(conn_id);
                json!({
                    "success": true,
                    "user_name": user,
                    "total_poses": crate::enrollment::POSE_SEQUENCE.len(),
                    "current_pose": 0,
                    "pose_info": pose_info(0),
                })
            }
            Err(e) => failure(&e),
        }
    }

    async fn process_enroll_frame(&self) -> Value {
        match self.engine.process_enroll_frame().await {
            Ok(reply) => json!({
                "success": true,
                "completed": reply.completed,
                "current_pose": reply.current_pose,
                "total_poses": reply.total_poses,
                "pose_info": { "name": reply.pose_name, "instruction": reply.pose_instruction },
                "status": reply.status,
                "face_box": reply.face_box.map(box_to_array),
                "frame": base64::engine::general_purpose::STANDARD.encode(&reply.frame_jpeg),
            }),
            Err(e) => failure(&e),
        }
    }

    async fn capture_enroll_pose(&self) -> Value {
        match self.engine.capture_enroll_pose().await {
            Ok(reply) => {
                if reply.completed {
                    *self.session_owner.lock().await = None;
                    json!({ "success": true, "completed": true, "message": "Enrollment saved" })
                } else {
                    json!({
                        "success": true,
                        "completed": false,
                        "current_pose": reply.current_pose,
                        "pose_info": {
                            "name": reply.pose_name,
                            "instruction": reply.pose_instruction,
                        },
                    })
                }
            }
            Err(e) => failure(&e),
        }
    }

    async fn stop_enrollment(&self) -> Value {
        *self.session_owner.lock().await = None;
        match self.engine.stop_enrollment().await {
            Ok(()) | Err(EngineError::NoSession) => json!({ "success": true }),
            Err(e) => failure(&e),
        }
    }

    async fn get_intrusions(&self) -> Value {
        match self.engine.get_intrusions().await {
            Ok(files) => json!({ "success": true, "files": files }),
            Err(e) => failure(&e),
        }
    }

    async fn confirm_intrusion(&self, params: &Value) -> Value {
        match intrusion_id(params) {
            Some(id) => match self.engine.confirm_intrusion(id).await {
                Ok(found) => json!({ "success": true, "found": found }),
                Err(e) => failure(&e),
            },
            None => json!({ "success": false, "error": "filename required" }),
        }
    }

    async fn delete_intrusion(&self, params: &Value) -> Value {
        match intrusion_id(params) {
            Some(id) => match self.engine.delete_intrusion(id).await {
                Ok(found) => json!({ "success": true, "found": found }),
                Err(e) => failure(&e),
            },
            None => json!({ "success": false, "error": "filename required" }),
        }
    }
}

/// Extract the entry id from a `filename` param (path or bare id).
fn intrusion_id(params: &Value) -> Option<String> {
    let filename = params.get("filename").and_then(Value::as_str)?;
    let stem = std::path::Path::new(filename).file_stem()?.to_str()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

fn failure(error: &EngineError) -> Value {
    json!({ "success": false, "error": error.code(), "detail": error.to_string() })
}

fn box_to_array((x, y, w, h): (f32, f32, f32, f32)) -> Value {
    json!([x, y, w, h])
}

fn map_to_object(map: BTreeMap<String, Value>) -> Value {
    Value::Object(map.into_iter().collect())
}

fn pose_info(index: usize) -> Value {
    let pose = crate::enrollment::POSE_SEQUENCE[index];
    json!({ "name": pose.name(), "instruction": pose.instruction() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrusion_id_from_path() {
        let params = json!({ "filename": "/var/lib/sentinel/blacklist/abc-123.jpg" });
        assert_eq!(intrusion_id(&params).as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_intrusion_id_from_bare_id() {
        let params = json!({ "filename": "abc-123" });
        assert_eq!(intrusion_id(&params).as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_intrusion_id_missing() {
        assert!(intrusion_id(&json!({})).is_none());
    }

    #[test]
    fn test_box_serialization() {
        let v = box_to_array((1.0, 2.0, 3.0, 4.0));
        assert_eq!(v, json!([1.0, 2.0, 3.0, 4.0]));
    }
}
