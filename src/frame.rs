//! Raw frames and 4:2:2 decoding.
//!
//! - `RawFrame`: opaque sensor buffer in packed YUYV layout, produced by a
//!   `FrameSource` per read and consumed immediately by the decoder.
//! - `YuyvImage`: decoded planar 4:2:2 image. The plane-length invariants are
//!   fixed at construction: the luma plane holds exactly `width * height`
//!   samples and each chroma plane holds exactly half that.
//!
//! A raw buffer whose length does not match the configured resolution is a
//! `DecodeError`. That signals a format/hardware misconfiguration, not a
//! transient glitch, so the acquisition loop treats it as fatal to the
//! session.

use image::RgbImage;

/// Packed YUYV (4:2:2) buffer straight off the device.
///
/// Layout per chroma sample index `i`: bytes `4i` and `4i+2` are the two luma
/// samples, `4i+1` is chroma-blue, `4i+3` is chroma-red. Expected length is
/// `width * height * 2`.
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Expected byte length for this frame's dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

/// Raw frame length did not match `width * height * 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub expected: usize,
    pub actual: usize,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "raw frame length mismatch: expected {} bytes, got {}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for DecodeError {}

/// Decoded planar 4:2:2 image.
///
/// Chroma is sampled at half horizontal resolution: pixel `(x, y)` reads luma
/// at `y * width + x` and chroma at `y * width / 2 + x / 2`.
#[derive(Clone, Debug)]
pub struct YuyvImage {
    y: Vec<u8>,
    cb: Vec<u8>,
    cr: Vec<u8>,
    width: u32,
    height: u32,
}

impl YuyvImage {
    /// Expand a packed YUYV buffer into planes.
    pub fn decode(raw: &RawFrame) -> Result<Self, DecodeError> {
        let expected = raw.expected_len();
        if raw.data.len() != expected {
            return Err(DecodeError {
                expected,
                actual: raw.data.len(),
            });
        }

        let luma_len = raw.width as usize * raw.height as usize;
        let chroma_len = luma_len / 2;
        let mut y = vec![0u8; luma_len];
        let mut cb = vec![0u8; chroma_len];
        let mut cr = vec![0u8; chroma_len];

        for i in 0..chroma_len {
            let ii = i * 4;
            y[i * 2] = raw.data[ii];
            y[i * 2 + 1] = raw.data[ii + 2];
            cb[i] = raw.data[ii + 1];
            cr[i] = raw.data[ii + 3];
        }

        Ok(Self {
            y,
            cb,
            cr,
            width: raw.width,
            height: raw.height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn luma(&self) -> &[u8] {
        &self.y
    }

    pub fn chroma_b(&self) -> &[u8] {
        &self.cb
    }

    pub fn chroma_r(&self) -> &[u8] {
        &self.cr
    }

    /// Convert to RGB for resizing, annotation, and JPEG encoding.
    ///
    /// Full-range BT.601 in fixed point, so repeated conversions of the same
    /// frame are bit-identical.
    pub fn to_rgb(&self) -> RgbImage {
        let w = self.width as usize;
        let half_w = w / 2;
        let mut out = RgbImage::new(self.width, self.height);

        for (py, row) in out.enumerate_rows_mut() {
            for (px, _, pixel) in row {
                let luma = self.y[py as usize * w + px as usize] as i32;
                let ci = py as usize * half_w + px as usize / 2;
                let d = self.cb[ci] as i32 - 128;
                let e = self.cr[ci] as i32 - 128;

                let r = luma + ((91881 * e) >> 16);
                let g = luma - ((22554 * d + 46802 * e) >> 16);
                let b = luma + ((116130 * d) >> 16);

                pixel.0 = [clamp_u8(r), clamp_u8(g), clamp_u8(b)];
            }
        }

        out
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
