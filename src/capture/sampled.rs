//! Sampled acquisition sessions.
//!
//! `SampledCapture` runs one acquisition loop per session. The loop pulls raw
//! frames from the device as fast as they arrive, but only frames that land
//! on or after the sampling tick are decoded and published; the rest are
//! dropped, never buffered. Publishing is a blocking send on a rendezvous
//! channel: a slow consumer stalls capture directly instead of growing a
//! queue.
//!
//! Cancellation is cooperative. The loop checks its stop flag before every
//! blocking device wait, and the wait itself is bounded, so worst-case stop
//! latency is one `FRAME_WAIT_TIMEOUT`.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameSource, FrameWait};
use crate::config::CaptureConfig;
use crate::frame::YuyvImage;

/// Upper bound on one blocking device wait. A liveness mechanism, not an
/// error path; it bounds how long a stop request can go unobserved.
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Start/stop seam for the gate. Lets the state machine be exercised with
/// mock sessions in tests.
pub trait CaptureSession {
    fn start(&mut self) -> Result<Receiver<YuyvImage>>;
    fn stop(&mut self) -> Result<()>;
}

/// A capture device plus its session lifecycle: Idle or Running, with
/// exactly one acquisition loop while Running.
pub struct SampledCapture<S: FrameSource + 'static> {
    config: CaptureConfig,
    /// The source, held here while Idle.
    idle: Option<S>,
    running: Option<Session<S>>,
}

struct Session<S> {
    stop: Arc<AtomicBool>,
    /// Returns the source so it can be reused by the next session.
    handle: JoinHandle<S>,
}

impl<S: FrameSource + 'static> SampledCapture<S> {
    pub fn new(source: S, config: CaptureConfig) -> Self {
        Self {
            config,
            idle: Some(source),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Idle -> Running. Configures the device, starts streaming, and spawns
    /// the acquisition loop. On any failure the state stays Idle and the
    /// source is retained for a later retry.
    pub fn start(&mut self) -> Result<Receiver<YuyvImage>> {
        let mut source = self
            .idle
            .take()
            .ok_or_else(|| anyhow!("capture session already running"))?;

        if let Err(err) = source.configure(&self.config) {
            self.idle = Some(source);
            return Err(err.context("configure capture device"));
        }
        if let Err(err) = source.start_streaming() {
            self.idle = Some(source);
            return Err(err.context("start device streaming"));
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(0);
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let interval = self.config.sample_interval;
        let handle = std::thread::spawn(move || acquisition_loop(source, tx, loop_stop, interval));

        self.running = Some(Session { stop, handle });
        Ok(rx)
    }

    /// Running -> Idle. Signals the loop, waits for it to exit, then stops
    /// device streaming. Must be paired one-to-one with `start`.
    pub fn stop(&mut self) -> Result<()> {
        let session = self
            .running
            .take()
            .ok_or_else(|| anyhow!("capture session not running"))?;
        session.stop.store(true, Ordering::Relaxed);
        let mut source = session
            .handle
            .join()
            .map_err(|_| anyhow!("acquisition loop panicked"))?;
        let result = source.stop_streaming();
        self.idle = Some(source);
        result
    }

    /// Release the device. Stops a running session first.
    pub fn close(mut self) -> Result<()> {
        if self.running.is_some() {
            self.stop()?;
        }
        if let Some(mut source) = self.idle.take() {
            source.close()?;
        }
        Ok(())
    }
}

impl<S: FrameSource + 'static> CaptureSession for SampledCapture<S> {
    fn start(&mut self) -> Result<Receiver<YuyvImage>> {
        SampledCapture::start(self)
    }

    fn stop(&mut self) -> Result<()> {
        SampledCapture::stop(self)
    }
}

/// The acquisition loop. Runs until the stop flag is observed, the consumer
/// goes away, or a (fatal) decode error.
fn acquisition_loop<S: FrameSource>(
    mut source: S,
    tx: SyncSender<YuyvImage>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> S {
    // First accepted frame comes one full interval after start, like a
    // ticker that fires at t + interval.
    let mut next_tick = Instant::now() + interval;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match source.wait_for_frame(FRAME_WAIT_TIMEOUT) {
            Ok(FrameWait::Ready) => {}
            Ok(FrameWait::TimedOut) => continue,
            Err(err) => {
                log::debug!("frame wait failed: {}", err);
                continue;
            }
        }

        let raw = match source.read_frame() {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("frame read failed: {}", err);
                continue;
            }
        };

        // Sampling gate: drop frames that arrive between ticks.
        let now = Instant::now();
        if now < next_tick {
            continue;
        }
        next_tick = now + interval;

        let image = match YuyvImage::decode(&raw) {
            Ok(image) => image,
            Err(err) => {
                log::error!("ending capture session: {}", err);
                break;
            }
        };

        // Blocking publish; backpressure by design.
        if tx.send(image).is_err() {
            break;
        }
    }

    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticFrameSource;

    fn capture(interval_ms: u64, fps: u32) -> SampledCapture<SyntheticFrameSource> {
        let config = CaptureConfig {
            device: "stub://printer_cam".to_string(),
            frame_width: 32,
            frame_height: 24,
            frame_rate: fps,
            sample_interval: Duration::from_millis(interval_ms),
            ..CaptureConfig::default()
        };
        SampledCapture::new(SyntheticFrameSource::new(), config)
    }

    #[test]
    fn publishes_at_most_one_image_per_interval() {
        let mut capture = capture(50, 100);
        let rx = capture.start().expect("start");

        let mut stamps = Vec::new();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).expect("image");
            stamps.push(Instant::now());
        }

        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(40),
                "publishes too close together: {:?}",
                gap
            );
        }

        drop(rx);
        capture.stop().expect("stop");
    }

    #[test]
    fn stop_closes_channel_and_session_restarts() {
        let mut capture = capture(10, 100);
        let rx = capture.start().expect("start");

        rx.recv_timeout(Duration::from_secs(5)).expect("image");

        // Keep draining while stop runs so a blocked publish can finish.
        let drainer = std::thread::spawn(move || while rx.recv().is_ok() {});
        capture.stop().expect("stop");
        drainer.join().expect("drainer");
        assert!(!capture.is_running());

        // A new session on the same device works.
        let rx = capture.start().expect("restart");
        rx.recv_timeout(Duration::from_secs(5)).expect("image");
        drop(rx);
        capture.stop().expect("stop again");
    }

    #[test]
    fn double_start_is_rejected() {
        let mut capture = capture(10, 100);
        let rx = capture.start().expect("start");
        assert!(capture.start().is_err());
        drop(rx);
        capture.stop().expect("stop");
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let mut capture = capture(10, 100);
        assert!(capture.stop().is_err());
    }

    #[test]
    fn close_without_start_releases_device() {
        let capture = capture(10, 100);
        capture.close().expect("close");
    }

    #[test]
    fn close_after_stop_releases_device() {
        let mut capture = capture(10, 100);
        let rx = capture.start().expect("start");
        rx.recv_timeout(Duration::from_secs(5)).expect("image");
        drop(rx);
        capture.stop().expect("stop");
        capture.close().expect("close");
    }

    #[test]
    fn close_stops_a_running_session() {
        let mut capture = capture(10, 100);
        let rx = capture.start().expect("start");
        rx.recv_timeout(Duration::from_secs(5)).expect("image");

        let drainer = std::thread::spawn(move || while rx.recv().is_ok() {});
        capture.close().expect("close");
        drainer.join().expect("drainer");
    }

    #[test]
    fn images_match_configured_resolution() {
        let mut capture = capture(10, 100);
        let rx = capture.start().expect("start");
        let image = rx.recv_timeout(Duration::from_secs(5)).expect("image");
        assert_eq!(image.width(), 32);
        assert_eq!(image.height(), 24);
        drop(rx);
        capture.stop().expect("stop");
    }
}
