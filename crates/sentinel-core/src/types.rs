use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of the face descriptor produced by the recognizer.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, with five facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: [(f32, f32); 5],
}

impl FaceDetection {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &FaceDetection) -> f32 {
        iou(
            (self.x, self.y, self.width, self.height),
            (other.x, other.y, other.width, other.height),
        )
    }
}

/// Intersection-over-union of two `(x, y, w, h)` boxes.
pub fn iou(a: (f32, f32, f32, f32), b: (f32, f32, f32, f32)) -> f32 {
    let x_left = a.0.max(b.0);
    let y_top = a.1.max(b.1);
    let x_right = (a.0 + a.2).min(b.0 + b.2);
    let y_bottom = (a.1 + a.3).min(b.1 + b.3);

    if x_right < x_left || y_bottom < y_top {
        return 0.0;
    }

    let intersection = (x_right - x_left) * (y_bottom - y_top);
    let union = a.2 * a.3 + b.2 * b.3 - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidValue,
    #[error("zero-norm embedding cannot be normalized")]
    ZeroNorm,
}

/// Unit-norm face descriptor. Immutable once minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Mint an embedding from a raw model output, L2-normalizing it.
    pub fn from_raw(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::InvalidDim(raw.len()));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidValue);
        }
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(Self {
            values: raw.iter().map(|x| x / norm).collect(),
        })
    }

    /// Reconstruct from persisted values that are already unit norm.
    ///
    /// Rejects vectors whose norm drifted beyond 1e-3 (corrupt file) rather
    /// than silently renormalizing them.
    pub fn from_stored(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::InvalidDim(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidValue);
        }
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if (norm - 1.0).abs() > 1e-3 {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Cosine distance `1 − a·b` (both operands are unit norm).
    pub fn distance(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }
}

/// Confidence tier of a gallery match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchTier {
    /// High-confidence match: grants access after the full liveness challenge.
    Golden,
    /// Ordinary match: grants access directly.
    Standard,
    /// Borderline match: biometrics alone are insufficient.
    TwoFactor,
    /// No usable match — treated as an intrusion.
    Unmatched,
}

/// Distance thresholds separating the tiers. Each bound is inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    pub golden: f32,
    pub standard: f32,
    pub twofa: f32,
}

impl TierThresholds {
    pub fn classify(&self, dist: f32) -> MatchTier {
        if dist <= self.golden {
            MatchTier::Golden
        } else if dist <= self.standard {
            MatchTier::Standard
        } else if dist <= self.twofa {
            MatchTier::TwoFactor
        } else {
            MatchTier::Unmatched
        }
    }
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            golden: 0.25,
            standard: 0.42,
            twofa: 0.50,
        }
    }
}

/// Smallest cosine distance from a probe to any embedding in a gallery slice.
///
/// Always traverses every entry (no early exit) so timing does not leak
/// gallery size or match position.
pub fn min_distance(probe: &Embedding, gallery: &[Embedding]) -> Option<f32> {
    let mut best: Option<f32> = None;
    for enrolled in gallery {
        let d = probe.distance(enrolled);
        best = Some(match best {
            Some(b) if b <= d => b,
            _ => d,
        });
    }
    best
}
