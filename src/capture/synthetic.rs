//! Synthetic frame source for `stub://` device paths.
//!
//! Generates deterministic YUYV frames paced at the configured frame rate, so
//! the sampling-interval gate and the stop signal are exercised for real in
//! tests without hardware.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{FrameSource, FrameWait};
use crate::config::CaptureConfig;
use crate::frame::RawFrame;

pub struct SyntheticFrameSource {
    config: Option<CaptureConfig>,
    streaming: bool,
    next_frame_due: Instant,
    frame_count: u64,
}

impl SyntheticFrameSource {
    pub fn new() -> Self {
        Self {
            config: None,
            streaming: false,
            next_frame_due: Instant::now(),
            frame_count: 0,
        }
    }

    fn frame_interval(&self) -> Duration {
        let rate = self.config.as_ref().map(|cfg| cfg.frame_rate).unwrap_or(1);
        Duration::from_secs_f64(1.0 / rate.max(1) as f64)
    }

    /// Fill a packed YUYV buffer with a pattern that varies per frame, so
    /// consecutive frames encode differently.
    fn generate_frame(&self, cfg: &CaptureConfig) -> Vec<u8> {
        let len = cfg.frame_width as usize * cfg.frame_height as usize * 2;
        let phase = self.frame_count;
        let mut data = vec![0u8; len];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = match i % 4 {
                // luma gradient that drifts with the frame counter
                0 | 2 => ((i / 4) as u64 + phase * 7).wrapping_mul(13) as u8,
                // chroma near neutral
                _ => 0x80u8.wrapping_add((phase % 16) as u8),
            };
        }
        data
    }
}

impl Default for SyntheticFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SyntheticFrameSource {
    fn configure(&mut self, cfg: &CaptureConfig) -> Result<()> {
        crate::config::validate_capture(cfg)?;
        self.config = Some(cfg.clone());
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        if self.config.is_none() {
            return Err(anyhow!("synthetic source not configured"));
        }
        self.streaming = true;
        self.next_frame_due = Instant::now();
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameWait> {
        if !self.streaming {
            return Err(anyhow!("synthetic source not streaming"));
        }
        let now = Instant::now();
        let remaining = self.next_frame_due.saturating_duration_since(now);
        if remaining > timeout {
            std::thread::sleep(timeout);
            return Ok(FrameWait::TimedOut);
        }
        std::thread::sleep(remaining);
        Ok(FrameWait::Ready)
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        let cfg = self
            .config
            .clone()
            .ok_or_else(|| anyhow!("synthetic source not configured"))?;
        let data = self.generate_frame(&cfg);
        let frame = RawFrame::new(data, cfg.frame_width, cfg.frame_height);
        self.frame_count += 1;
        self.next_frame_due += self.frame_interval();
        Ok(frame)
    }

    fn close(&mut self) -> Result<()> {
        self.streaming = false;
        self.config = None;
        Ok(())
    }
}
