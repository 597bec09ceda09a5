//! The log-sink line contract.
//!
//! Every accepted frame is emitted as one line, `data:image/jpeg;base64,`
//! followed by the base64 payload. The offline timelapse tool scans log
//! streams for exactly this prefix, so both sides share these helpers.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Render an encoded frame as a log line.
pub fn encode_line(jpeg: &[u8]) -> String {
    format!("{}{}", DATA_URI_PREFIX, BASE64.encode(jpeg))
}

/// Recover the JPEG bytes from a log line.
///
/// `None` means the line is not a frame line at all; `Some(Err)` means it
/// carried the prefix but the payload is corrupt.
pub fn decode_line(line: &str) -> Option<Result<Vec<u8>>> {
    let payload = line.trim_end().strip_prefix(DATA_URI_PREFIX)?;
    Some(
        BASE64
            .decode(payload)
            .context("decode base64 frame payload"),
    )
}
