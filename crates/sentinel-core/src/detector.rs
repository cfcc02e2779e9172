//! YuNet face detector via ONNX Runtime.
//!
//! Runs the detector on a resampled 640×640 input, decodes the `[N, 15]`
//! output rows (corner box, five landmarks, score), applies NMS and the
//! score / minimum-size filters, and returns detections sorted by area.

use crate::types::{iou, FaceDetection};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: usize = 640;
const ROW_ELEMENTS: usize = 15;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too small for {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection filter parameters.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Minimum detector confidence for a box to be kept.
    pub score_min: f32,
    /// IoU above which overlapping boxes are suppressed.
    pub nms_threshold: f32,
    /// Minimum face side length in pixels; `min(w, h)` at exactly this value passes.
    pub min_face_px: f32,
    /// Cap on detections returned per frame.
    pub max_faces: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_min: 0.6,
            nms_threshold: 0.3,
            min_face_px: 100.0,
            max_faces: 5,
        }
    }
}

/// YuNet-family face detector.
pub struct FaceDetector {
    session: Session,
    config: DetectorConfig,
}

impl FaceDetector {
    /// Load the detector ONNX model from the given path.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
            "loaded face detector model"
        );

        Ok(Self { session, config })
    }

    /// Detect faces in a packed BGR frame at native resolution.
    ///
    /// Returns at most `max_faces` detections sorted by area descending.
    /// Deterministic for identical input and model.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceDetection>, DetectorError> {
        if frame.len() < (width as usize) * (height as usize) * 3 {
            return Err(DetectorError::InvalidFrame { width, height });
        }

        let input = preprocess(frame, width as usize, height as usize);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detector output: {e}")))?;

        let mut faces = decode_rows(rows, width as f32, height as f32, self.config.score_min);
        faces = nms(faces, self.config.nms_threshold);

        // Size filter after NMS so a large true face is never suppressed by
        // a small overlapping false positive.
        faces.retain(|f| f.width.min(f.height) >= self.config.min_face_px);

        faces.sort_by(|a, b| {
            b.area()
                .partial_cmp(&a.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        faces.truncate(self.config.max_faces);
        Ok(faces)
    }
}

/// Resize the BGR frame to the fixed detector input with bilinear sampling
/// and lay it out as a NCHW float tensor (raw 0–255 values, BGR order).
fn preprocess(frame: &[u8], width: usize, height: usize) -> Array4<f32> {
    let size = DETECTOR_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    let sx = width as f32 / size as f32;
    let sy = height as f32 / size as f32;

    for y in 0..size {
        for x in 0..size {
            let fx = x as f32 * sx;
            let fy = y as f32 * sy;
            let x0 = (fx.floor() as usize).min(width - 1);
            let y0 = (fy.floor() as usize).min(height - 1);
            let x1 = (x0 + 1).min(width - 1);
            let y1 = (y0 + 1).min(height - 1);
            let dx = fx - x0 as f32;
            let dy = fy - y0 as f32;

            for c in 0..3 {
                let s = |px: usize, py: usize| frame[(py * width + px) * 3 + c] as f32;
                let val = s(x0, y0) * (1.0 - dx) * (1.0 - dy)
                    + s(x1, y0) * dx * (1.0 - dy)
                    + s(x0, y1) * (1.0 - dx) * dy
                    + s(x1, y1) * dx * dy;
                tensor[[0, c, y, x]] = val;
            }
        }
    }

    tensor
}

/// Decode raw `[N, 15]` rows into frame-space detections.
///
/// Each row: [x1, y1, x2, y2, right_eye_x, right_eye_y, left_eye_x,
/// left_eye_y, nose_x, nose_y, mouth_right_x, mouth_right_y, mouth_left_x,
/// mouth_left_y, score], coordinates normalized to [0, 1]. Landmarks are
/// reordered to [left_eye, right_eye, nose, left_mouth, right_mouth] for
/// the alignment stage.
fn decode_rows(rows: &[f32], frame_w: f32, frame_h: f32, score_min: f32) -> Vec<FaceDetection> {
    let mut faces = Vec::new();

    for row in rows.chunks_exact(ROW_ELEMENTS) {
        let score = row[14];
        if score < score_min {
            continue;
        }

        let (x1, y1, x2, y2) = (row[0], row[1], row[2], row[3]);
        let pt = |ix: usize| (row[ix] * frame_w, row[ix + 1] * frame_h);

        faces.push(FaceDetection {
            x: x1 * frame_w,
            y: y1 * frame_h,
            width: (x2 - x1) * frame_w,
            height: (y2 - y1) * frame_h,
            score,
            landmarks: [pt(6), pt(4), pt(8), pt(12), pt(10)],
        });
    }

    faces
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut faces: Vec<FaceDetection>, threshold: f32) -> Vec<FaceDetection> {
    faces.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<FaceDetection> = Vec::new();
    for face in faces {
        let overlaps = kept.iter().any(|k| {
            iou(
                (k.x, k.y, k.width, k.height),
                (face.x, face.y, face.width, face.height),
            ) > threshold
        });
        if !overlaps {
            kept.push(face);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> [f32; ROW_ELEMENTS] {
        let mut r = [0.0f32; ROW_ELEMENTS];
        r[0] = x1;
        r[1] = y1;
        r[2] = x2;
        r[3] = y2;
        // landmarks at the box center
        let (cx, cy) = ((x1 + x2) / 2.0, (y1 + y2) / 2.0);
        for i in 0..5 {
            r[4 + i * 2] = cx;
            r[5 + i * 2] = cy;
        }
        r[14] = score;
        r
    }

    #[test]
    fn test_decode_scales_to_frame() {
        let rows = row(0.25, 0.25, 0.75, 0.75, 0.9);
        let faces = decode_rows(&rows, 640.0, 480.0, 0.6);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 160.0).abs() < 1e-3);
        assert!((f.y - 120.0).abs() < 1e-3);
        assert!((f.width - 320.0).abs() < 1e-3);
        assert!((f.height - 240.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_drops_low_scores() {
        let rows = row(0.1, 0.1, 0.5, 0.5, 0.3);
        assert!(decode_rows(&rows, 640.0, 480.0, 0.6).is_empty());
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let mut rows = Vec::new();
        rows.extend_from_slice(&row(0.20, 0.20, 0.60, 0.60, 0.9));
        rows.extend_from_slice(&row(0.22, 0.22, 0.62, 0.62, 0.8)); // heavy overlap, lower score
        rows.extend_from_slice(&row(0.70, 0.70, 0.95, 0.95, 0.85)); // disjoint

        let faces = decode_rows(&rows, 640.0, 480.0, 0.6);
        let kept = nms(faces, 0.3);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_min_face_boundary() {
        // Exactly min_face_px passes; one pixel below is rejected.
        let config = DetectorConfig::default();
        let exact = FaceDetection {
            x: 0.0,
            y: 0.0,
            width: config.min_face_px,
            height: config.min_face_px + 20.0,
            score: 0.9,
            landmarks: [(0.0, 0.0); 5],
        };
        let small = FaceDetection {
            width: config.min_face_px - 1.0,
            ..exact.clone()
        };
        let mut faces = vec![exact, small];
        faces.retain(|f| f.width.min(f.height) >= config.min_face_px);
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn test_preprocess_shape() {
        let frame = vec![100u8; 320 * 240 * 3];
        let tensor = preprocess(&frame, 320, 240);
        assert_eq!(
            tensor.shape(),
            &[1, 3, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE]
        );
        // Uniform input stays uniform through bilinear resampling
        assert!((tensor[[0, 0, 10, 10]] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_landmark_reorder() {
        // Distinct landmark positions so the reorder is observable
        let mut r = [0.0f32; ROW_ELEMENTS];
        r[2] = 1.0;
        r[3] = 1.0;
        r[14] = 0.9;
        // YuNet order: right_eye, left_eye, nose, mouth_right, mouth_left
        let coords = [(0.1, 0.1), (0.2, 0.1), (0.15, 0.2), (0.12, 0.3), (0.18, 0.3)];
        for (i, (x, y)) in coords.iter().enumerate() {
            r[4 + i * 2] = *x;
            r[5 + i * 2] = *y;
        }
        let faces = decode_rows(&r, 100.0, 100.0, 0.6);
        let lm = faces[0].landmarks;
        // Output order: left_eye, right_eye, nose, left_mouth, right_mouth
        assert!((lm[0].0 - 20.0).abs() < 1e-3);
        assert!((lm[1].0 - 10.0).abs() < 1e-3);
        assert!((lm[2].1 - 20.0).abs() < 1e-3);
        assert!((lm[3].0 - 18.0).abs() < 1e-3);
        assert!((lm[4].0 - 12.0).abs() < 1e-3);
    }
}
