//! SFace face recognizer via ONNX Runtime.
//!
//! Extracts 128-dimensional unit-norm face embeddings from aligned
//! 112×112 face crops.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Embedding, EmbeddingError, FaceDetection, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding rejected: {0}")]
    BadEmbedding(#[from] EmbeddingError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SFace-family embedding extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the recognizer ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>(),
            "loaded face recognizer model"
        );

        Ok(Self { session })
    }

    /// Extract a unit-norm embedding for a detected face in a BGR frame.
    ///
    /// The face is aligned to the canonical 112×112 position using its
    /// five landmarks before inference. Deterministic for identical input
    /// and model.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceDetection,
    ) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(frame, width, height, &face.landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::from_raw(raw)?)
    }
}

/// Lay out an aligned 112×112 BGR crop as a NCHW float tensor.
///
/// The model consumes RGB channel order and raw 0–255 values.
fn preprocess(aligned_bgr: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let base = (y * size + x) * 3;
            let b = aligned_bgr.get(base).copied().unwrap_or(0) as f32;
            let g = aligned_bgr.get(base + 1).copied().unwrap_or(0) as f32;
            let r = aligned_bgr.get(base + 2).copied().unwrap_or(0) as f32;
            tensor[[0, 0, y, x]] = r;
            tensor[[0, 1, y, x]] = g;
            tensor[[0, 2, y, x]] = b;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_swaps_to_rgb() {
        // BGR pixel (10, 20, 30): channel 0 of the tensor must carry R=30
        let mut aligned = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        aligned[0] = 10;
        aligned[1] = 20;
        aligned[2] = 30;
        let tensor = preprocess(&aligned);
        assert_eq!(tensor[[0, 0, 0, 0]], 30.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 20.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 10.0);
    }

    #[test]
    fn test_preprocess_raw_range() {
        // The recognizer takes raw pixel values, not normalized ones
        let aligned = vec![255u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor[[0, 0, 50, 50]], 255.0);
    }
}
