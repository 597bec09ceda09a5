//! Budget-constrained JPEG encoding.
//!
//! `AdaptiveEncoder` searches a fixed descending ladder of target heights and
//! returns the tallest rendition whose encoded size fits the byte budget.
//! Quality and resampling filter are fixed, so the chosen height is stable
//! across repeated calls on the same image.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

/// Target heights tried by the fit search, strictly descending.
pub const SIZE_LADDER: [u32; 5] = [1080, 720, 480, 360, 240];

const JPEG_QUALITY: u8 = 75;

/// Why a frame could not be fitted.
///
/// `NoFit` is recoverable; callers skip the frame. `Encode` is an encoder
/// I/O failure and usually is not.
#[derive(Debug)]
pub enum FitError {
    NoFit { budget: usize },
    Encode(image::ImageError),
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::NoFit { budget } => {
                write!(f, "no size candidate fits within {} bytes", budget)
            }
            FitError::Encode(err) => write!(f, "jpeg encode failed: {}", err),
        }
    }
}

impl std::error::Error for FitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FitError::NoFit { .. } => None,
            FitError::Encode(err) => Some(err),
        }
    }
}

/// An encoded frame that passed the budget check.
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    /// The ladder height that was chosen.
    pub height: u32,
}

/// First-fit search over the size ladder.
pub struct AdaptiveEncoder {
    max_bytes: usize,
    candidates: Vec<u32>,
}

impl AdaptiveEncoder {
    /// Candidates taller than `ceiling_height` are dropped up front; the
    /// remaining list stays descending so the richest rendition is tried
    /// first.
    pub fn new(max_bytes: usize, ceiling_height: u32) -> Self {
        let candidates = SIZE_LADDER
            .iter()
            .copied()
            .filter(|height| *height <= ceiling_height)
            .collect();
        Self {
            max_bytes,
            candidates,
        }
    }

    pub fn candidates(&self) -> &[u32] {
        &self.candidates
    }

    /// Resize (aspect-preserving, Lanczos), encode, and return the first
    /// candidate strictly under the budget.
    pub fn fit(&self, image: &RgbImage) -> Result<EncodedFrame, FitError> {
        for &height in &self.candidates {
            let resized = resize_to_height(image, height);
            let jpeg = encode_jpeg(&resized, JPEG_QUALITY).map_err(FitError::Encode)?;
            if jpeg.len() < self.max_bytes {
                return Ok(EncodedFrame { jpeg, height });
            }
        }
        Err(FitError::NoFit {
            budget: self.max_bytes,
        })
    }
}

/// Resize to the target height, preserving aspect ratio.
pub fn resize_to_height(image: &RgbImage, height: u32) -> RgbImage {
    let width = ((image.width() as u64 * height as u64) / image.height() as u64).max(1) as u32;
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}

/// Encode to JPEG at a fixed quality.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(image)?;
    Ok(buf)
}
