//! Frame type and image processing — BGR frames, luminance CLAHE, JPEG codec.

use image::codecs::jpeg::JpegEncoder;

/// A captured color camera frame, packed BGR (3 bytes per pixel).
#[derive(Clone)]
pub struct Frame {
    /// Interleaved BGR pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u64,
}

impl Frame {
    /// Average luminance (0.0–255.0), Rec.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .data
            .chunks_exact(3)
            .map(|px| 0.114 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.299 * f64::from(px[2]))
            .sum();
        (sum / (self.data.len() / 3) as f64) as f32
    }

    /// Extract the luminance plane (width * height bytes).
    pub fn to_luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let y = 0.114 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.299 * f32::from(px[2]);
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// Check if a luminance plane is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// histogram bucket (0–31).
pub fn is_dark_frame(luma: &[u8], threshold_pct: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark_count = luma.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / luma.len() as f32) > threshold_pct
}

/// Apply Contrast-Limited Adaptive Histogram Equalization to a BGR frame.
///
/// The luminance plane is equalized with a tile-based clipped-histogram CDF
/// (bilinear interpolation between tile CDFs), then each color pixel is
/// scaled by the per-pixel luminance gain so chroma is preserved.
pub fn clahe_enhance(frame: &mut Frame, tiles_x: u32, clip_limit: f32) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    if w == 0 || h == 0 || frame.data.len() < w * h * 3 {
        return;
    }

    let mut luma = frame.to_luma();
    let original = luma.clone();
    clahe_luma(&mut luma, frame.width, frame.height, tiles_x, clip_limit);

    for (i, px) in frame.data.chunks_exact_mut(3).enumerate() {
        let before = original[i] as f32;
        if before < 1.0 {
            continue;
        }
        let gain = luma[i] as f32 / before;
        for c in px.iter_mut() {
            *c = (f32::from(*c) * gain).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Tile-based CLAHE on a single luminance plane.
fn clahe_luma(gray: &mut [u8], width: u32, height: u32, tiles_x: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || gray.len() < w * h {
        return;
    }

    let tiles_y = tiles_x; // square grid
    let tx = tiles_x as usize;
    let ty = tiles_y as usize;
    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;

    // Build per-tile CDFs
    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            // Clip histogram and redistribute excess
            let clip = (clip_limit * tile_pixels as f32) as u32;
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            // Build CDF, normalized to 0–255
            let mut cdf = [0f32; 256];
            cdf[0] = hist[0] as f32;
            for i in 1..256 {
                cdf[i] = cdf[i - 1] + hist[i] as f32;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = (tile_pixels as f32) - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    // Map each pixel using bilinear interpolation between tile CDFs
    for y in 0..h {
        for x in 0..w {
            let pixel = gray[y * w + x] as usize;

            let fy = (y as f32 / tile_h as f32) - 0.5;
            let fx = (x as f32 / tile_w as f32) - 0.5;

            let fy = fy.clamp(0.0, (ty - 1) as f32);
            let fx = fx.clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = cdfs[r0 * tx + c0][pixel];
            let tr = cdfs[r0 * tx + c1][pixel];
            let bl = cdfs[r1 * tx + c0][pixel];
            let br = cdfs[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Decode a JPEG buffer (e.g. an MJPG camera frame) into packed BGR.
pub fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    let mut bgr = img.into_raw();
    for px in bgr.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok((bgr, width, height))
}

/// Encode a BGR frame as JPEG at the given quality (1–100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut rgb = frame.data.clone();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    image::RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| FrameError::Encode("buffer size does not match dimensions".into()))?
        .write_with_encoder(encoder)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("JPEG decode failed: {0}")]
    Decode(String),
    #[error("JPEG encode failed: {0}")]
    Encode(String),
}
