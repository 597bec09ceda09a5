use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::encode::SIZE_LADDER;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_FRAME_WIDTH: u32 = 2304;
const DEFAULT_FRAME_HEIGHT: u32 = 1536;
const DEFAULT_FRAME_RATE: u32 = 2;
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_LOG_BYTES: usize = 256_000;
const DEFAULT_MAX_IMAGE_HEIGHT: u32 = 1080;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Pixel format requested from the capture device.
///
/// Only packed 4:2:2 is supported; the decoder in `frame` assumes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Yuyv,
}

impl PixelFormat {
    /// The V4L2 fourcc for this format.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yuyv" => Ok(PixelFormat::Yuyv),
            other => Err(anyhow!("unsupported pixel format '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    camera: Option<CameraConfigFile>,
    print: Option<PrintConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    pixel_format: Option<PixelFormat>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    frame_rate: Option<u32>,
    sample_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PrintConfigFile {
    max_log_bytes: Option<usize>,
    max_image_height: Option<u32>,
    printer_status_url: Option<String>,
    ml_api_url: Option<String>,
    poll_interval_secs: Option<u64>,
}

/// Immutable capture configuration. Fixed before a session starts and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path, or `stub://...` for the synthetic source.
    pub device: String,
    pub pixel_format: PixelFormat,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames per second requested from the device.
    pub frame_rate: u32,
    /// Minimum wall-clock spacing between accepted frames.
    pub sample_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            pixel_format: PixelFormat::Yuyv,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            frame_rate: DEFAULT_FRAME_RATE,
            sample_interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
        }
    }
}

/// Pipeline configuration: size budget, gating, and collaborators.
#[derive(Debug, Clone)]
pub struct PrintConfig {
    /// Maximum bytes of one emitted log line. Keep below the log backend's
    /// line limit.
    pub max_log_bytes: usize,
    /// Tallest resize candidate the encoder may pick.
    pub max_image_height: u32,
    /// Printer status endpoint. When set, frames are only captured while a
    /// print job is ongoing.
    pub printer_status_url: Option<String>,
    /// Failure-detection service. When set, detections are drawn onto frames
    /// before encoding.
    pub ml_api_url: Option<String>,
    /// How often the printer status endpoint is polled.
    pub poll_interval: Duration,
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            max_image_height: DEFAULT_MAX_IMAGE_HEIGHT,
            printer_status_url: None,
            ml_api_url: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub camera: CaptureConfig,
    pub print: PrintConfig,
}

impl Config {
    /// Load from the file named by `PRINTLGTM_CONFIG` (if set), apply env
    /// overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRINTLGTM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let camera_file = file.camera.unwrap_or_default();
        let print_file = file.print.unwrap_or_default();

        let camera = CaptureConfig {
            device: camera_file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            pixel_format: camera_file.pixel_format.unwrap_or_default(),
            frame_width: camera_file.frame_width.unwrap_or(DEFAULT_FRAME_WIDTH),
            frame_height: camera_file.frame_height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            frame_rate: camera_file.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            sample_interval: Duration::from_secs(
                camera_file
                    .sample_interval_secs
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECS),
            ),
        };
        let print = PrintConfig {
            max_log_bytes: print_file.max_log_bytes.unwrap_or(DEFAULT_MAX_LOG_BYTES),
            max_image_height: print_file
                .max_image_height
                .unwrap_or(DEFAULT_MAX_IMAGE_HEIGHT),
            printer_status_url: print_file.printer_status_url,
            ml_api_url: print_file.ml_api_url,
            poll_interval: Duration::from_secs(
                print_file
                    .poll_interval_secs
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
        };

        Self { camera, print }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("PRINTLGTM_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(url) = std::env::var("PRINTLGTM_STATUS_URL") {
            if !url.trim().is_empty() {
                self.print.printer_status_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("PRINTLGTM_ML_API_URL") {
            if !url.trim().is_empty() {
                self.print.ml_api_url = Some(url);
            }
        }
        if let Ok(interval) = std::env::var("PRINTLGTM_SAMPLE_INTERVAL_SECS") {
            let secs: u64 = interval.parse().map_err(|_| {
                anyhow!("PRINTLGTM_SAMPLE_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.camera.sample_interval = Duration::from_secs(secs);
        }
        if let Ok(bytes) = std::env::var("PRINTLGTM_MAX_LOG_BYTES") {
            let bytes: usize = bytes
                .parse()
                .map_err(|_| anyhow!("PRINTLGTM_MAX_LOG_BYTES must be an integer"))?;
            self.print.max_log_bytes = bytes;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_capture(&self.camera)?;
        validate_print(&self.print)?;
        Ok(())
    }
}

pub fn validate_capture(cfg: &CaptureConfig) -> Result<()> {
    if cfg.frame_width == 0 || cfg.frame_height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    if cfg.frame_width % 2 != 0 {
        return Err(anyhow!(
            "frame width must be even for packed 4:2:2 ({} given)",
            cfg.frame_width
        ));
    }
    if cfg.frame_rate == 0 {
        return Err(anyhow!("frame rate must be greater than zero"));
    }
    if cfg.sample_interval.is_zero() {
        return Err(anyhow!("sample interval must be greater than zero"));
    }
    Ok(())
}

pub fn validate_print(cfg: &PrintConfig) -> Result<()> {
    if !SIZE_LADDER.contains(&cfg.max_image_height) {
        return Err(anyhow!(
            "max image height must be one of {:?} ({} given)",
            SIZE_LADDER,
            cfg.max_image_height
        ));
    }
    if cfg.max_log_bytes == 0 {
        return Err(anyhow!("max log bytes must be greater than zero"));
    }
    if cfg.poll_interval.is_zero() {
        return Err(anyhow!("poll interval must be greater than zero"));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults valid");
    }

    #[test]
    fn odd_width_rejected() {
        let cfg = CaptureConfig {
            frame_width: 641,
            ..CaptureConfig::default()
        };
        assert!(validate_capture(&cfg).is_err());
    }

    #[test]
    fn off_ladder_height_rejected() {
        let cfg = PrintConfig {
            max_image_height: 600,
            ..PrintConfig::default()
        };
        assert!(validate_print(&cfg).is_err());
    }
}
