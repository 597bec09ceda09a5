//! V4L2 frame source.
//!
//! Wraps a local device node (e.g. /dev/video0) behind the `FrameSource`
//! contract. The memory-mapped stream borrows the device handle, so the two
//! live together in a self-referencing holder while streaming; `stop` takes
//! the device back out for the next session.
//!
//! The bounded frame wait is a `poll(2)` on the device fd, which is what
//! keeps the acquisition loop's cancellation latency finite when the camera
//! stalls.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use super::{FrameSource, FrameWait};
use crate::config::CaptureConfig;
use crate::frame::RawFrame;

pub struct V4l2FrameSource {
    device_path: String,
    /// Present after `configure`, before streaming.
    idle: Option<v4l::Device>,
    streaming: Option<Streaming>,
    active_width: u32,
    active_height: u32,
}

struct Streaming {
    /// Raw fd of the device inside `state`; valid while `state` is alive.
    fd: RawFd,
    state: V4l2State,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2FrameSource {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            idle: None,
            streaming: None,
            active_width: 0,
            active_height: 0,
        }
    }
}

impl FrameSource for V4l2FrameSource {
    fn configure(&mut self, cfg: &CaptureConfig) -> Result<()> {
        use v4l::video::Capture;

        crate::config::validate_capture(cfg)?;

        let device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = cfg.frame_width;
        format.height = cfg.frame_height;
        format.fourcc = v4l::FourCC::new(&cfg.pixel_format.fourcc());

        let negotiated = device
            .set_format(&format)
            .with_context(|| format!("set v4l2 format on {}", self.device_path))?;
        if negotiated.fourcc != format.fourcc {
            return Err(anyhow!(
                "device {} rejected pixel format {}: offered {}",
                self.device_path,
                format.fourcc,
                negotiated.fourcc
            ));
        }
        if negotiated.width != cfg.frame_width || negotiated.height != cfg.frame_height {
            return Err(anyhow!(
                "device {} rejected {}x{}: offered {}x{}",
                self.device_path,
                cfg.frame_width,
                cfg.frame_height,
                negotiated.width,
                negotiated.height
            ));
        }

        let params = v4l::video::capture::Parameters::with_fps(cfg.frame_rate);
        device
            .set_params(&params)
            .with_context(|| format!("set v4l2 frame rate on {}", self.device_path))?;

        self.active_width = negotiated.width;
        self.active_height = negotiated.height;
        self.idle = Some(device);
        log::info!(
            "v4l2 source configured: {} {}x{} @ {} fps",
            self.device_path,
            self.active_width,
            self.active_height,
            cfg.frame_rate
        );
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::io::traits::Stream;

        let device = self
            .idle
            .take()
            .ok_or_else(|| anyhow!("v4l2 device not configured"))?;
        let fd = device.as_raw_fd();

        let mut state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        state
            .with_stream_mut(|stream| stream.start())
            .context("start v4l2 streaming")?;
        self.streaming = Some(Streaming { fd, state });
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        use v4l::io::traits::Stream;

        let mut streaming = self
            .streaming
            .take()
            .ok_or_else(|| anyhow!("v4l2 device not streaming"))?;
        let stop_result = streaming
            .state
            .with_stream_mut(|stream| stream.stop())
            .context("stop v4l2 streaming");
        // Recover the device handle for the next session either way.
        self.idle = Some(streaming.state.into_heads().device);
        stop_result
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameWait> {
        let fd = self
            .streaming
            .as_ref()
            .ok_or_else(|| anyhow!("v4l2 device not streaming"))?
            .fd;

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match rc {
            0 => Ok(FrameWait::TimedOut),
            n if n > 0 => Ok(FrameWait::Ready),
            _ => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    // Signal delivery; let the loop re-check its stop flag.
                    return Ok(FrameWait::TimedOut);
                }
                Err(anyhow::Error::new(err).context("poll v4l2 device"))
            }
        }
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        let streaming = self
            .streaming
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device not streaming"))?;
        let data = streaming
            .state
            .with_stream_mut(|stream| -> Result<Vec<u8>> {
                let (buf, meta) = stream.next().context("dequeue v4l2 frame")?;
                let used = meta.bytesused as usize;
                if used > 0 && used <= buf.len() {
                    Ok(buf[..used].to_vec())
                } else {
                    Ok(buf.to_vec())
                }
            })?;

        Ok(RawFrame::new(data, self.active_width, self.active_height))
    }

    fn close(&mut self) -> Result<()> {
        if self.streaming.is_some() {
            // Best effort; the handle is going away regardless.
            if let Err(err) = self.stop_streaming() {
                log::warn!("v4l2 stop during close failed: {}", err);
            }
        }
        self.idle = None;
        Ok(())
    }
}
