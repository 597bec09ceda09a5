//! Frame acquisition.
//!
//! This module owns the capture device and the sampled acquisition loop:
//! - `FrameSource`: the device contract (configure, stream, bounded wait,
//!   read). V4L2 devices behind the `capture-v4l2` feature, plus a synthetic
//!   source for `stub://` device paths.
//! - `SampledCapture`: one acquisition loop per session, gating raw frames
//!   through the sampling interval and publishing decoded images.
//!
//! The device handle is owned exclusively here; it is never touched by two
//! loops at once. Start/stop pairing is the caller's job (see `gate`).

mod sampled;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

pub use sampled::{CaptureSession, SampledCapture, FRAME_WAIT_TIMEOUT};
pub use synthetic::SyntheticFrameSource;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2FrameSource;

use anyhow::Result;
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::frame::RawFrame;

/// Outcome of a bounded wait for the next frame.
///
/// A timeout is not an error; it means "no frame yet, try again" and is how
/// the acquisition loop observes its stop signal while the camera stalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameWait {
    Ready,
    TimedOut,
}

/// A physical (or synthetic) capture device.
///
/// `configure` must be called before streaming and fails if the device
/// rejects the format/resolution/rate combination. `read_frame` must only be
/// called after `wait_for_frame` reported `Ready`. Idempotency of
/// start/stop is on the caller.
pub trait FrameSource: Send {
    fn configure(&mut self, cfg: &CaptureConfig) -> Result<()>;

    fn start_streaming(&mut self) -> Result<()>;

    fn stop_streaming(&mut self) -> Result<()>;

    /// Block up to `timeout` for the next frame to complete.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameWait>;

    /// Read the most recently completed frame buffer.
    fn read_frame(&mut self) -> Result<RawFrame>;

    /// Release the device handle. Safe to call even if never started.
    fn close(&mut self) -> Result<()>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn configure(&mut self, cfg: &CaptureConfig) -> Result<()> {
        (**self).configure(cfg)
    }

    fn start_streaming(&mut self) -> Result<()> {
        (**self).start_streaming()
    }

    fn stop_streaming(&mut self) -> Result<()> {
        (**self).stop_streaming()
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameWait> {
        (**self).wait_for_frame(timeout)
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        (**self).read_frame()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Select a source backend by device path.
///
/// `stub://` paths get the synthetic source; anything else is a V4L2 device
/// node and requires the `capture-v4l2` feature.
pub fn open_source(cfg: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    if cfg.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticFrameSource::new()));
    }

    #[cfg(feature = "capture-v4l2")]
    {
        Ok(Box::new(V4l2FrameSource::new(&cfg.device)))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        Err(anyhow::anyhow!(
            "device {} requires the capture-v4l2 feature",
            cfg.device
        ))
    }
}
