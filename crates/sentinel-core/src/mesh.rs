//! Dense facial landmark inference (face-mesh ONNX model).
//!
//! Produces the ~468-point mesh used by the blink detector. The model
//! consumes a padded square RGB crop around the detected face; landmark
//! coordinates come back normalized to the crop and are mapped to frame
//! space with a center-based transform so clamping at frame edges does
//! not shift the mesh.

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Mesh model input side length.
const MESH_INPUT_SIZE: usize = 192;
/// Minimum landmark count for a usable mesh (models with iris refinement
/// emit 478; the base topology is 468).
pub const MESH_MIN_LANDMARKS: usize = 468;
/// Padding around the face box before cropping.
const CROP_PAD_RATIO: f32 = 0.25;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("mesh output too small: {0} landmarks")]
    TooFewLandmarks(usize),
    #[error("face box does not intersect the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One mesh landmark in frame coordinates.
#[derive(Debug, Clone, Copy)]
pub struct MeshLandmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Face-mesh landmark extractor.
pub struct FaceMesh {
    session: Session,
}

impl FaceMesh {
    /// Load the face-mesh ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, MeshError> {
        if !Path::new(model_path).exists() {
            return Err(MeshError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded face mesh model");
        Ok(Self { session })
    }

    /// Run the mesh on the face region of a packed BGR frame.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face_box: (f32, f32, f32, f32),
    ) -> Result<Vec<MeshLandmark>, MeshError> {
        let crop = expand_square(face_box, width as f32, height as f32, CROP_PAD_RATIO)
            .ok_or(MeshError::EmptyCrop)?;

        let input = preprocess(frame, width as usize, height as usize, crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MeshError::InferenceFailed(format!("mesh output: {e}")))?;

        let count = raw.len() / 3;
        if count < MESH_MIN_LANDMARKS {
            return Err(MeshError::TooFewLandmarks(count));
        }

        Ok(raw
            .chunks_exact(3)
            .map(|lm| {
                let (fx, fy) = map_to_frame(lm[0] / MESH_INPUT_SIZE as f32, lm[1] / MESH_INPUT_SIZE as f32, crop);
                MeshLandmark {
                    x: fx,
                    y: fy,
                    z: lm[2],
                }
            })
            .collect())
    }
}

/// Expand the face box into a padded square, clamped to the frame.
/// Returns `(x, y, side)` or `None` if the box misses the frame entirely.
fn expand_square(
    (x, y, w, h): (f32, f32, f32, f32),
    frame_w: f32,
    frame_h: f32,
    pad_ratio: f32,
) -> Option<(f32, f32, f32)> {
    if w <= 0.0 || h <= 0.0 {
        return None;
    }

    let cx = x + w / 2.0;
    let cy = y + h / 2.0;
    let side = w.max(h) * (1.0 + pad_ratio);

    let left = (cx - side / 2.0).max(0.0);
    let top = (cy - side / 2.0).max(0.0);
    let side = side.min(frame_w - left).min(frame_h - top);

    if side <= 1.0 {
        return None;
    }
    Some((left, top, side))
}

/// Map normalized crop coordinates back to frame space around the crop
/// center, so clamping never translates the mesh.
fn map_to_frame(nx: f32, ny: f32, (crop_x, crop_y, side): (f32, f32, f32)) -> (f32, f32) {
    let cx = crop_x + side / 2.0;
    let cy = crop_y + side / 2.0;
    (cx + (nx - 0.5) * side, cy + (ny - 0.5) * side)
}

/// Sample the crop region into the model input: RGB, [0, 1], NCHW.
fn preprocess(
    frame: &[u8],
    src_w: usize,
    src_h: usize,
    (crop_x, crop_y, side): (f32, f32, f32),
) -> Array4<f32> {
    let size = MESH_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let fx = crop_x + x as f32 * side / size as f32;
            let fy = crop_y + y as f32 * side / size as f32;
            let px = (fx.round() as usize).min(src_w.saturating_sub(1));
            let py = (fy.round() as usize).min(src_h.saturating_sub(1));
            let base = (py * src_w + px) * 3;
            if base + 2 >= frame.len() {
                continue;
            }
            // BGR → RGB
            tensor[[0, 0, y, x]] = frame[base + 2] as f32 / 255.0;
            tensor[[0, 1, y, x]] = frame[base + 1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = frame[base] as f32 / 255.0;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_square_pads_and_centers() {
        let (x, y, side) = expand_square((100.0, 100.0, 80.0, 100.0), 640.0, 480.0, 0.25).unwrap();
        // side = max(80, 100) * 1.25 = 125, centered on (140, 150)
        assert!((side - 125.0).abs() < 1e-3);
        assert!((x - 77.5).abs() < 1e-3);
        assert!((y - 87.5).abs() < 1e-3);
    }

    #[test]
    fn test_expand_square_clamps_to_frame() {
        let (x, y, side) = expand_square((0.0, 0.0, 100.0, 100.0), 120.0, 120.0, 0.25).unwrap();
        assert!(x >= 0.0 && y >= 0.0);
        assert!(x + side <= 120.0 + 1e-3);
        assert!(y + side <= 120.0 + 1e-3);
    }

    #[test]
    fn test_expand_square_rejects_degenerate() {
        assert!(expand_square((10.0, 10.0, 0.0, 50.0), 640.0, 480.0, 0.25).is_none());
    }

    #[test]
    fn test_map_to_frame_center_fixed_point() {
        let crop = (100.0, 50.0, 200.0);
        let (fx, fy) = map_to_frame(0.5, 0.5, crop);
        assert!((fx - 200.0).abs() < 1e-3);
        assert!((fy - 150.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_to_frame_corners() {
        let crop = (0.0, 0.0, 100.0);
        let (fx, fy) = map_to_frame(0.0, 0.0, crop);
        assert!((fx - 0.0).abs() < 1e-3);
        assert!((fy - 0.0).abs() < 1e-3);
        let (fx, fy) = map_to_frame(1.0, 1.0, crop);
        assert!((fx - 100.0).abs() < 1e-3);
        assert!((fy - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let frame = vec![255u8; 64 * 64 * 3];
        let tensor = preprocess(&frame, 64, 64, (0.0, 0.0, 64.0));
        assert_eq!(tensor.shape(), &[1, 3, MESH_INPUT_SIZE, MESH_INPUT_SIZE]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }
}
