//! Threaded V4L2 camera capture with a single-slot latest-frame buffer.
//!
//! A producer thread drains the device as fast as it delivers and overwrites
//! one shared slot; consumers always see the most recent frame and never
//! queue behind slow ticks. MJPG frames are decoded to packed BGR on the
//! producer thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::frame::{self, Frame};

#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera stream is not running")]
    NotStarted,
}

/// Capture parameters for one stream.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// V4L2 device index (`/dev/video{N}`).
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// `read()` returns `None` for this long after `start()` while the
    /// sensor's AGC/AE settles.
    pub warmup_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            width: 640,
            height: 480,
            fps: 15,
            warmup_ms: 500,
        }
    }
}

struct Shared {
    latest: Mutex<Option<Frame>>,
    fault: Mutex<Option<CameraError>>,
    stop: AtomicBool,
}

/// Threaded camera stream.
///
/// `start()` opens the device (probing the next index once if the configured
/// one fails), then spawns the producer loop. `read()` clones the latest
/// frame. `stop()` signals the producer and joins it; the device is released
/// when the producer exits, including on fatal capture errors.
pub struct CameraStream {
    config: CameraConfig,
    shared: Arc<Shared>,
    producer: Option<std::thread::JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl CameraStream {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                latest: Mutex::new(None),
                fault: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            producer: None,
            started_at: None,
        }
    }

    /// Open the device and start the producer thread.
    pub fn start(&mut self) -> Result<(), CameraError> {
        let camera = open_with_fallback(&self.config)?;

        self.shared.stop.store(false, Ordering::SeqCst);
        *self.shared.latest.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.shared.fault.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("sentinel-camera".into())
            .spawn(move || producer_loop(camera, shared))
            .map_err(|e| CameraError::OpenFailed {
                device: "producer thread".into(),
                reason: e.to_string(),
            })?;

        self.producer = Some(handle);
        self.started_at = Some(Instant::now());
        info!(
            device = self.config.device_id,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "camera stream started"
        );
        Ok(())
    }

    /// Return the most recent frame, or `None` during warmup / before the
    /// first frame lands. A fatal producer error surfaces here.
    pub fn read(&self) -> Result<Option<Frame>, CameraError> {
        let started = self.started_at.ok_or(CameraError::NotStarted)?;

        if let Some(err) = self
            .shared
            .fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }

        if started.elapsed() < Duration::from_millis(self.config.warmup_ms) {
            return Ok(None);
        }

        Ok(self
            .shared
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    /// Stop the producer and release the device.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        self.started_at = None;
        info!(device = self.config.device_id, "camera stream stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
            && self
                .shared
                .fault
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_none()
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the configured device; if that fails, probe the next index once.
fn open_with_fallback(config: &CameraConfig) -> Result<rscam::Camera, CameraError> {
    match open_device(config.device_id, config) {
        Ok(cam) => Ok(cam),
        Err(first_err) => {
            warn!(
                device = config.device_id,
                error = %first_err,
                "camera failed to open; probing next index"
            );
            open_device(config.device_id + 1, config).map_err(|_| first_err)
        }
    }
}

fn open_device(device_id: u32, config: &CameraConfig) -> Result<rscam::Camera, CameraError> {
    let path = format!("/dev/video{device_id}");
    if !std::path::Path::new(&path).exists() {
        return Err(CameraError::DeviceNotFound(path));
    }

    let mut camera = rscam::Camera::new(&path).map_err(|e| CameraError::OpenFailed {
        device: path.clone(),
        reason: e.to_string(),
    })?;

    camera
        .start(&rscam::Config {
            interval: (1, config.fps),
            resolution: (config.width, config.height),
            format: b"MJPG",
            ..Default::default()
        })
        .map_err(|e| CameraError::OpenFailed {
            device: path,
            reason: format!("stream negotiation failed (MJPG {}x{}): {e}", config.width, config.height),
        })?;

    Ok(camera)
}

/// Producer loop: capture, decode, overwrite the latest slot.
///
/// Transient decode failures are skipped; repeated capture failures are
/// fatal and recorded for the consumer. The device is released when the
/// loop returns (rscam stops the stream on drop).
fn producer_loop(camera: rscam::Camera, shared: Arc<Shared>) {
    let mut sequence: u64 = 0;
    let mut consecutive_failures: u32 = 0;
    const MAX_CONSECUTIVE_FAILURES: u32 = 10;

    while !shared.stop.load(Ordering::SeqCst) {
        let raw = match camera.capture() {
            Ok(raw) => {
                consecutive_failures = 0;
                raw
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(error = %e, "camera capture failing persistently; releasing device");
                    *shared.fault.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(CameraError::CaptureFailed(e.to_string()));
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };

        match frame::decode_jpeg(&raw[..]) {
            Ok((data, width, height)) => {
                sequence += 1;
                let frame = Frame {
                    data,
                    width,
                    height,
                    timestamp: Instant::now(),
                    sequence,
                };
                *shared.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame);
            }
            Err(e) => {
                // Corrupt MJPG frames happen during exposure changes; skip.
                warn!(error = %e, "dropping undecodable frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_before_start_errors() {
        let stream = CameraStream::new(CameraConfig::default());
        assert!(matches!(stream.read(), Err(CameraError::NotStarted)));
    }

    #[test]
    fn test_missing_device_reported() {
        let config = CameraConfig {
            device_id: 250, // far outside any real install
            ..CameraConfig::default()
        };
        let err = open_device(250, &config).unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut stream = CameraStream::new(CameraConfig::default());
        stream.stop();
        stream.stop();
        assert!(!stream.is_running());
    }
}
