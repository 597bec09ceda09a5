//! Offline timelapse reconstruction.
//!
//! Frames logged by the daemon end up in Loki; this module pulls them back
//! out with `query_range`, strips the data-URI framing, and packs the JPEGs
//! into MJPEG AVI files. A gap in the log (an empty query window) means the
//! printer was idle between jobs, so it closes the current file and the next
//! frames start a new one.
//!
//! The AVI writer is deliberately minimal: one video stream, `MJPG` codec,
//! `00dc` chunks and an `idx1` index, sizes patched on close. Players take
//! the real frame dimensions from the JPEG payloads.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::logline::decode_line;

const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One query window. At ~200 KB per line, five minutes of frames stays well
/// under the per-query limit.
const WINDOW_SECS: i64 = 5 * 60;
const WINDOW_LIMIT: usize = 1000;
/// How far before the first matching line the scan starts.
const SEEK_BACK_SECS: i64 = 10;

/// Nominal stream geometry written into the AVI header.
const VIDEO_WIDTH: u32 = 1920;
const VIDEO_HEIGHT: u32 = 1080;
const VIDEO_FPS: u32 = 24;

// Header byte positions patched when the file is closed.
const RIFF_SIZE_POS: u64 = 4;
const TOTAL_FRAMES_POS: u64 = 48;
const STREAM_LENGTH_POS: u64 = 140;
const MOVI_SIZE_POS: u64 = 216;
const HEADER_LEN: u64 = 224;

/// Incremental MJPEG AVI file writer.
pub struct AviWriter {
    file: File,
    path: PathBuf,
    index: Vec<(u32, u32)>,
    movi_bytes: u32,
}

impl AviWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(&header_prefix())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            index: Vec::new(),
            movi_bytes: 4, // the "movi" fourcc
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u32 {
        self.index.len() as u32
    }

    /// Append one JPEG as a `00dc` chunk. Chunks are padded to even length as
    /// RIFF requires; the index records the unpadded size.
    pub fn add_frame(&mut self, jpeg: &[u8]) -> Result<()> {
        let size = u32::try_from(jpeg.len()).map_err(|_| anyhow!("frame too large for AVI"))?;
        self.file.write_all(b"00dc")?;
        self.file.write_all(&size.to_le_bytes())?;
        self.file.write_all(jpeg)?;
        let mut padded = size;
        if size % 2 != 0 {
            self.file.write_all(&[0])?;
            padded += 1;
        }
        self.index.push((self.movi_bytes, size));
        self.movi_bytes += 8 + padded;
        Ok(())
    }

    /// Write the index and patch the placeholder sizes.
    pub fn close(mut self) -> Result<()> {
        self.file.write_all(b"idx1")?;
        let idx_len = (self.index.len() as u32) * 16;
        self.file.write_all(&idx_len.to_le_bytes())?;
        for (offset, size) in &self.index {
            self.file.write_all(b"00dc")?;
            self.file.write_all(&0x10u32.to_le_bytes())?; // keyframe
            self.file.write_all(&offset.to_le_bytes())?;
            self.file.write_all(&size.to_le_bytes())?;
        }

        let total = self.file.stream_position()?;
        let frames = self.index.len() as u32;
        patch_u32(&mut self.file, RIFF_SIZE_POS, (total - 8) as u32)?;
        patch_u32(&mut self.file, TOTAL_FRAMES_POS, frames)?;
        patch_u32(&mut self.file, STREAM_LENGTH_POS, frames)?;
        patch_u32(&mut self.file, MOVI_SIZE_POS, self.movi_bytes)?;
        self.file.flush()?;
        Ok(())
    }
}

fn patch_u32(file: &mut File, pos: u64, value: u32) -> Result<()> {
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// The fixed 224-byte prefix up to the first frame chunk. Frame-dependent
/// fields hold zero placeholders until `close` patches them.
fn header_prefix() -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    let u32le = |h: &mut Vec<u8>, v: u32| h.extend_from_slice(&v.to_le_bytes());
    let u16le = |h: &mut Vec<u8>, v: u16| h.extend_from_slice(&v.to_le_bytes());

    h.extend_from_slice(b"RIFF");
    u32le(&mut h, 0); // riff size, patched
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 192); // hdrl list
    h.extend_from_slice(b"hdrl");

    h.extend_from_slice(b"avih");
    u32le(&mut h, 56);
    u32le(&mut h, 1_000_000 / VIDEO_FPS); // microseconds per frame
    u32le(&mut h, 0); // max bytes per second
    u32le(&mut h, 0); // padding granularity
    u32le(&mut h, 0x10); // AVIF_HASINDEX
    u32le(&mut h, 0); // total frames, patched
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // streams
    u32le(&mut h, 0); // suggested buffer size
    u32le(&mut h, VIDEO_WIDTH);
    u32le(&mut h, VIDEO_HEIGHT);
    for _ in 0..4 {
        u32le(&mut h, 0); // reserved
    }

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 116); // strl list
    h.extend_from_slice(b"strl");

    h.extend_from_slice(b"strh");
    u32le(&mut h, 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, 0); // flags
    u16le(&mut h, 0); // priority
    u16le(&mut h, 0); // language
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // scale
    u32le(&mut h, VIDEO_FPS); // rate
    u32le(&mut h, 0); // start
    u32le(&mut h, 0); // length in frames, patched
    u32le(&mut h, 0); // suggested buffer size
    u32le(&mut h, 0); // quality
    u32le(&mut h, 0); // sample size
    u16le(&mut h, 0); // frame rect
    u16le(&mut h, 0);
    u16le(&mut h, VIDEO_WIDTH as u16);
    u16le(&mut h, VIDEO_HEIGHT as u16);

    h.extend_from_slice(b"strf");
    u32le(&mut h, 40);
    u32le(&mut h, 40); // BITMAPINFOHEADER size
    u32le(&mut h, VIDEO_WIDTH);
    u32le(&mut h, VIDEO_HEIGHT);
    u16le(&mut h, 1); // planes
    u16le(&mut h, 24); // bits per pixel
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, VIDEO_WIDTH * VIDEO_HEIGHT * 3); // image size
    u32le(&mut h, 0); // x pels per meter
    u32le(&mut h, 0); // y pels per meter
    u32le(&mut h, 0); // colors used
    u32le(&mut h, 0); // colors important

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 0); // movi list size, patched
    h.extend_from_slice(b"movi");

    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    h
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    values: Vec<(String, String)>,
}

/// One retrieved log line with its nanosecond timestamp.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp_ns: i64,
    pub line: String,
}

/// Loki `query_range` client. Credentials, when given, go out as basic auth
/// on every request.
pub struct LokiClient {
    query_url: Url,
    query: String,
    agent: ureq::Agent,
    basic_auth: Option<String>,
}

impl LokiClient {
    pub fn new(
        base_url: &str,
        query: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let base: Url = base_url
            .parse()
            .with_context(|| format!("invalid Loki URL: {}", base_url))?;
        let query_url = base
            .join(QUERY_RANGE_PATH)
            .context("failed to build query_range URL")?;
        let basic_auth = match (username, password) {
            (Some(user), Some(pass)) => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", user, pass))
            )),
            _ => None,
        };
        Ok(Self {
            query_url,
            query: query.to_string(),
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            basic_auth,
        })
    }

    /// Fetch up to `limit` lines in `[start, end)`, oldest first.
    pub fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut request = self
            .agent
            .get(self.query_url.as_str())
            .query("query", &self.query)
            .query("start", &start.to_rfc3339())
            .query("end", &end.to_rfc3339())
            .query("direction", "forward")
            .query("limit", &limit.to_string());
        if let Some(auth) = &self.basic_auth {
            request = request.set("Authorization", auth);
        }
        let body = request
            .call()
            .context("Loki query failed")?
            .into_string()
            .context("failed to read Loki response")?;
        let response: QueryResponse =
            serde_json::from_str(&body).context("unexpected Loki response body")?;
        parse_streams(response)
    }
}

fn parse_streams(response: QueryResponse) -> Result<Vec<LogEntry>> {
    if response.data.result_type != "streams" {
        bail!("unexpected result type: {}", response.data.result_type);
    }
    if response.data.result.len() > 1 {
        bail!(
            "query matched {} streams, expected one; tighten the selector",
            response.data.result.len()
        );
    }
    let mut entries = Vec::new();
    for stream in response.data.result {
        for (ts, line) in stream.values {
            let timestamp_ns: i64 = ts
                .parse()
                .with_context(|| format!("bad entry timestamp: {}", ts))?;
            entries.push(LogEntry { timestamp_ns, line });
        }
    }
    Ok(entries)
}

/// Splits retrieved frames into one AVI file per print job.
pub struct TimelapseBuilder {
    output_dir: PathBuf,
    encode_mp4: bool,
    current: Option<AviWriter>,
    produced: usize,
}

impl TimelapseBuilder {
    pub fn new(output_dir: &Path, encode_mp4: bool) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            encode_mp4,
            current: None,
            produced: 0,
        }
    }

    /// Number of completed files so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Append one frame, opening a new numbered file if none is in progress.
    pub fn add_frame(&mut self, jpeg: &[u8], at: DateTime<Utc>) -> Result<()> {
        if self.current.is_none() {
            let name = format!("timelapse-{}-{}.avi", self.produced, at.format("%Y-%m-%d"));
            let path = self.output_dir.join(name);
            log::info!("timelapse started: {}", path.display());
            self.current = Some(AviWriter::create(&path)?);
        }
        let writer = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("no timelapse file in progress"))?;
        writer.add_frame(jpeg)
    }

    /// A gap in the log: finish the file in progress, if any.
    pub fn split(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            let path = writer.path().to_path_buf();
            log::info!(
                "timelapse finished: {} ({} frames)",
                path.display(),
                writer.frame_count()
            );
            writer.close()?;
            if self.encode_mp4 {
                encode_to_mp4(&path)?;
            }
            self.produced += 1;
        }
        Ok(())
    }

    /// Finish any open file and return the number produced.
    pub fn finish(mut self) -> Result<usize> {
        self.split()?;
        Ok(self.produced)
    }
}

/// Re-encode an AVI to MP4 with ffmpeg. Writes to a temp name first so an
/// interrupted encode never leaves a half-written `.mp4` behind.
pub fn encode_to_mp4(avi_path: &Path) -> Result<()> {
    let output = avi_path.with_extension("mp4");
    let tmp = avi_path.with_extension("tmp.mp4");
    let status = std::process::Command::new("ffmpeg")
        .arg("-i")
        .arg(avi_path)
        .args(["-c:v", "mpeg4", "-qscale", "0"])
        .arg(&tmp)
        .status()
        .context("failed to run ffmpeg, is it installed?")?;
    if !status.success() {
        bail!("ffmpeg exited with {} for {}", status, avi_path.display());
    }
    std::fs::rename(&tmp, &output)
        .with_context(|| format!("failed to move {} into place", output.display()))?;
    Ok(())
}

/// Drive the full reconstruction: seek to the first matching line, then walk
/// the range in fixed windows, splitting files on empty windows.
pub fn reconstruct(
    client: &LokiClient,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    builder: &mut TimelapseBuilder,
) -> Result<()> {
    let first = client.fetch(start, end, 1)?;
    let Some(first) = first.first() else {
        log::warn!("no frame lines between {} and {}", start, end);
        return Ok(());
    };
    let mut cursor = DateTime::from_timestamp_nanos(first.timestamp_ns)
        - ChronoDuration::seconds(SEEK_BACK_SECS);

    while cursor < end {
        let window_end = std::cmp::min(cursor + ChronoDuration::seconds(WINDOW_SECS), end);
        let entries = client.fetch(cursor, window_end, WINDOW_LIMIT)?;

        if entries.is_empty() {
            builder.split()?;
        } else {
            for entry in &entries {
                let Some(decoded) = decode_line(&entry.line) else {
                    continue;
                };
                let jpeg = decoded.context("undecodable frame line")?;
                image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
                    .context("frame line does not hold a valid JPEG")?;
                builder.add_frame(&jpeg, DateTime::from_timestamp_nanos(entry.timestamp_ns))?;
            }
        }
        cursor = window_end;
    }

    Ok(())
}
