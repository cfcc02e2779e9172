//! MiniFASNet anti-spoofing gate with self-calibrating preprocessing.
//!
//! The classifier is sensitive to channel order and to which output class
//! carries the "live" probability, and exported models disagree on both.
//! Instead of hardcoding a convention, the detector scores all six fixed
//! preprocessing configurations (color order × live-class index) on an
//! enrollment capture — known to be a live subject — and keeps the
//! configuration with the largest margin between the median live score and
//! the decision boundary. The choice is persisted and reused across runs.

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Classifier input side length.
const SPOOF_INPUT_SIZE: usize = 80;
/// Context scale around the face box for the square crop.
const CROP_SCALE: f32 = 2.7;
/// Number of output classes the live index can point at.
const NUM_CLASSES: usize = 3;
/// Frames collected before calibration is finalized.
pub const CALIBRATION_SAMPLES: usize = 80;

#[derive(Error, Debug)]
pub enum SpoofError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Persisted preprocessing choice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpoofCalibration {
    pub use_rgb: bool,
    pub live_idx: usize,
    pub calibrated: bool,
}

impl Default for SpoofCalibration {
    fn default() -> Self {
        Self {
            use_rgb: false,
            live_idx: 0,
            calibrated: false,
        }
    }
}

/// The six candidate configurations, in a fixed order.
fn combos() -> [(bool, usize); 6] {
    [
        (false, 0),
        (false, 1),
        (false, 2),
        (true, 0),
        (true, 1),
        (true, 2),
    ]
}

struct CalibrationRun {
    /// Live-score samples per candidate configuration.
    scores: Vec<Vec<f32>>,
    samples: usize,
    target: usize,
}

/// Two-class live-vs-spoof gate over an aligned square crop.
pub struct SpoofDetector {
    session: Session,
    threshold: f32,
    calibration: SpoofCalibration,
    calibration_path: PathBuf,
    run: Option<CalibrationRun>,
}

impl SpoofDetector {
    /// Load the classifier and any persisted calibration.
    ///
    /// The decision threshold always comes from configuration, never from
    /// the calibration file.
    pub fn load(
        model_path: &str,
        calibration_path: &Path,
        threshold: f32,
    ) -> Result<Self, SpoofError> {
        if !Path::new(model_path).exists() {
            return Err(SpoofError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let calibration = match std::fs::read_to_string(calibration_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => SpoofCalibration::default(),
        };

        let run = if calibration.calibrated {
            None
        } else {
            Some(new_run(CALIBRATION_SAMPLES))
        };

        tracing::info!(
            path = model_path,
            calibrated = calibration.calibrated,
            use_rgb = calibration.use_rgb,
            live_idx = calibration.live_idx,
            "loaded anti-spoof model"
        );

        Ok(Self {
            session,
            threshold,
            calibration,
            calibration_path: calibration_path.to_path_buf(),
            run,
        })
    }

    pub fn is_calibrating(&self) -> bool {
        self.run.is_some()
    }

    pub fn calibration(&self) -> SpoofCalibration {
        self.calibration
    }

    /// Discard the persisted choice and restart calibration collection.
    pub fn recalibrate(&mut self) {
        self.calibration = SpoofCalibration::default();
        self.run = Some(new_run(CALIBRATION_SAMPLES));
        let _ = std::fs::remove_file(&self.calibration_path);
        tracing::info!("anti-spoof calibration reset");
    }

    /// Feed one known-live frame into the calibration run.
    ///
    /// Once enough samples are collected the best configuration is chosen
    /// and persisted; subsequent calls are no-ops.
    pub fn calibrate_tick(&mut self, frame: &[u8], width: u32, height: u32, face_box: (f32, f32, f32, f32)) {
        let Some(run) = self.run.as_mut() else {
            return;
        };

        let Some(crop) = square_crop(frame, width as usize, height as usize, face_box, CROP_SCALE)
        else {
            return;
        };

        let mut per_combo = Vec::with_capacity(6);
        for (use_rgb, live_idx) in combos() {
            let input = preprocess(&crop, use_rgb);
            let score = match run_probs(&mut self.session, &input) {
                Ok(probs) => probs.get(live_idx).copied().unwrap_or(0.0),
                Err(_) => 0.0,
            };
            per_combo.push(score);
        }
        for (bucket, score) in run.scores.iter_mut().zip(per_combo) {
            bucket.push(score);
        }
        run.samples += 1;

        if run.samples >= run.target {
            let (use_rgb, live_idx) = pick_best_combo(&run.scores, self.threshold);
            self.calibration = SpoofCalibration {
                use_rgb,
                live_idx,
                calibrated: true,
            };
            self.run = None;
            self.persist();
            tracing::info!(
                use_rgb,
                live_idx,
                "anti-spoof calibration complete"
            );
        }
    }

    /// Classify the face region of a BGR frame.
    ///
    /// Returns `(live, score)`; `live = score ≥ threshold`. Any failure to
    /// infer — including an unfinished calibration — is reported as
    /// `(false, 0.0)` so the gate fails closed.
    pub fn is_live(&mut self, frame: &[u8], width: u32, height: u32, face_box: (f32, f32, f32, f32)) -> (bool, f32) {
        if self.run.is_some() {
            return (false, 0.0);
        }

        let Some(crop) = square_crop(frame, width as usize, height as usize, face_box, CROP_SCALE)
        else {
            return (false, 0.0);
        };

        let input = preprocess(&crop, self.calibration.use_rgb);
        match run_probs(&mut self.session, &input) {
            Ok(probs) => {
                let score = probs.get(self.calibration.live_idx).copied().unwrap_or(0.0);
                (score >= self.threshold, score)
            }
            Err(e) => {
                tracing::warn!(error = %e, "anti-spoof inference failed; treating as spoof");
                (false, 0.0)
            }
        }
    }

    fn persist(&self) {
        if let Some(parent) = self.calibration_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.calibration) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.calibration_path, text) {
                    tracing::warn!(error = %e, "failed to persist spoof calibration");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize spoof calibration"),
        }
    }
}

fn new_run(target: usize) -> CalibrationRun {
    CalibrationRun {
        scores: vec![Vec::new(); 6],
        samples: 0,
        target,
    }
}

fn run_probs(session: &mut Session, input: &Array4<f32>) -> Result<Vec<f32>, SpoofError> {
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (_, logits) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(SpoofError::Ort)?;
    Ok(softmax(&logits[..logits.len().min(NUM_CLASSES)]))
}

/// Pick the configuration whose median live score clears the boundary by
/// the widest margin.
fn pick_best_combo(scores: &[Vec<f32>], threshold: f32) -> (bool, usize) {
    let mut best = combos()[0];
    let mut best_margin = f32::NEG_INFINITY;
    for (combo, samples) in combos().into_iter().zip(scores) {
        let margin = median(samples) - threshold;
        if margin > best_margin {
            best_margin = margin;
            best = combo;
        }
    }
    best
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum::<f32>() + 1e-9;
    exps.iter().map(|v| v / sum).collect()
}

/// Cut a square crop around the face box at `scale` times its larger side,
/// clipped to the frame, and resize it to the classifier input with
/// bilinear sampling. Returns packed BGR.
fn square_crop(
    frame: &[u8],
    src_w: usize,
    src_h: usize,
    (x, y, w, h): (f32, f32, f32, f32),
    scale: f32,
) -> Option<Vec<u8>> {
    if src_w == 0 || src_h == 0 || frame.len() < src_w * src_h * 3 || w <= 0.0 || h <= 0.0 {
        return None;
    }

    let center_x = x + w / 2.0;
    let center_y = y + h / 2.0;
    let side = w.max(h) * scale;

    let left = (center_x - side / 2.0).round().max(0.0) as usize;
    let top = (center_y - side / 2.0).round().max(0.0) as usize;
    let right = ((left as f32 + side).round() as usize).min(src_w - 1);
    let bottom = ((top as f32 + side).round() as usize).min(src_h - 1);

    if right <= left || bottom <= top {
        return None;
    }

    let crop_w = right - left;
    let crop_h = bottom - top;
    let out = SPOOF_INPUT_SIZE;
    let mut resized = vec![0u8; out * out * 3];

    for oy in 0..out {
        for ox in 0..out {
            let fx = left as f32 + ox as f32 * crop_w as f32 / out as f32;
            let fy = top as f32 + oy as f32 * crop_h as f32 / out as f32;
            let x0 = (fx.floor() as usize).min(src_w - 1);
            let y0 = (fy.floor() as usize).min(src_h - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let y1 = (y0 + 1).min(src_h - 1);
            let dx = fx - x0 as f32;
            let dy = fy - y0 as f32;

            for c in 0..3 {
                let s = |px: usize, py: usize| frame[(py * src_w + px) * 3 + c] as f32;
                let val = s(x0, y0) * (1.0 - dx) * (1.0 - dy)
                    + s(x1, y0) * dx * (1.0 - dy)
                    + s(x0, y1) * (1.0 - dx) * dy
                    + s(x1, y1) * dx * dy;
                resized[(oy * out + ox) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Some(resized)
}

/// Normalize an 80×80 BGR crop to [-1, 1] and lay it out NCHW, optionally
/// swapping to RGB channel order.
fn preprocess(crop_bgr: &[u8], use_rgb: bool) -> Array4<f32> {
    let size = SPOOF_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let base = (y * size + x) * 3;
            let b = crop_bgr[base] as f32;
            let g = crop_bgr[base + 1] as f32;
            let r = crop_bgr[base + 2] as f32;
            let (c0, c1, c2) = if use_rgb { (r, g, b) } else { (b, g, r) };

            let norm = |v: f32| (v / 255.0 - 0.5) / 0.5;
            tensor[[0, 0, y, x]] = norm(c0);
            tensor[[0, 1, y, x]] = norm(c1);
            tensor[[0, 2, y, x]] = norm(c2);
        }
    }

    tensor
}
