//! The encode/log worker.
//!
//! One `FramePipeline` worker runs per capture session, consuming the
//! session's image channel until it closes: optionally annotate with
//! ML-detected failures, fit under the line budget, emit one log line.
//!
//! `LogSink` and `Telemetry` are passed-in collaborators rather than
//! process-wide globals, so a pipeline is testable in isolation.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::PrintConfig;
use crate::detect::{annotate, FailureDetector};
use crate::encode::{encode_jpeg, AdaptiveEncoder, FitError};
use crate::frame::YuyvImage;
use crate::logline::{encode_line, DATA_URI_PREFIX};

/// Where frame lines go.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: &str) -> Result<()>;
}

/// The production sink: one line per frame on stdout.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn emit(&self, line: &str) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.clone()).unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, line: &str) -> Result<()> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        lines.push(line.to_string());
        Ok(())
    }
}

/// Observability collaborator. Explicitly constructed and passed in so
/// capture sessions stay independently testable.
pub trait Telemetry: Send + Sync {
    fn frame_logged(&self, _height: u32, _bytes: usize) {}
    fn frame_skipped(&self, _budget: usize) {}
    fn status_poll(&self, _ok: bool) {}
    fn detection(&self, _ok: bool, _failures: usize) {}
}

pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Telemetry that reports through the log.
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn frame_logged(&self, height: u32, bytes: usize) {
        log::info!("frame logged: {}p, {} bytes", height, bytes);
    }

    fn frame_skipped(&self, budget: usize) {
        log::warn!("frame skipped: no candidate fits {} bytes", budget);
    }

    fn status_poll(&self, ok: bool) {
        log::debug!("printer status poll ok={}", ok);
    }

    fn detection(&self, ok: bool, failures: usize) {
        if ok {
            log::debug!("failure detection: {} detections", failures);
        } else {
            log::debug!("failure detection unavailable");
        }
    }
}

/// Per-session consumer of the capture channel.
pub struct FramePipeline {
    encoder: AdaptiveEncoder,
    detector: Option<FailureDetector>,
    sink: Arc<dyn LogSink>,
    telemetry: Arc<dyn Telemetry>,
}

impl FramePipeline {
    pub fn new(
        cfg: &PrintConfig,
        detector: Option<FailureDetector>,
        sink: Arc<dyn LogSink>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        // The prefix counts against the line limit; the base64 payload is
        // what the budget actually constrains.
        let budget = cfg.max_log_bytes.saturating_sub(DATA_URI_PREFIX.len());
        Self {
            encoder: AdaptiveEncoder::new(budget, cfg.max_image_height),
            detector,
            sink,
            telemetry,
        }
    }

    /// Consume images until the channel closes. Sink failures end the
    /// worker; everything else is absorbed with a log line.
    pub fn run(&self, frames: Receiver<YuyvImage>) {
        for image in frames {
            let mut rgb = image.to_rgb();

            if let Some(detector) = &self.detector {
                self.annotate_frame(detector, &mut rgb);
            }

            match self.encoder.fit(&rgb) {
                Ok(frame) => {
                    if let Err(err) = self.sink.emit(&encode_line(&frame.jpeg)) {
                        log::error!("log sink failed, ending worker: {}", err);
                        return;
                    }
                    self.telemetry.frame_logged(frame.height, frame.jpeg.len());
                }
                Err(FitError::NoFit { budget }) => {
                    self.telemetry.frame_skipped(budget);
                }
                Err(err) => {
                    log::error!("frame encode failed: {}", err);
                }
            }
        }
    }

    /// Spawn the worker on its own thread for one session's channel.
    pub fn spawn(self: &Arc<Self>, frames: Receiver<YuyvImage>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        std::thread::spawn(move || pipeline.run(frames))
    }

    fn annotate_frame(&self, detector: &FailureDetector, rgb: &mut image::RgbImage) {
        // Full-quality encode for the detector; the budgeted encode happens
        // after annotation.
        let full = match encode_jpeg(rgb, 100) {
            Ok(full) => full,
            Err(err) => {
                log::warn!("detection encode failed: {}", err);
                return;
            }
        };
        match detector.detect(&full) {
            Ok(failures) => {
                self.telemetry.detection(true, failures.len());
                if !failures.is_empty() {
                    annotate(rgb, &failures);
                }
            }
            Err(err) => {
                self.telemetry.detection(false, 0);
                log::warn!("failure detection skipped: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrintConfig;
    use crate::frame::RawFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::sync_channel;

    #[derive(Default)]
    struct CountingTelemetry {
        logged: AtomicUsize,
        skipped: AtomicUsize,
    }

    impl Telemetry for CountingTelemetry {
        fn frame_logged(&self, _height: u32, _bytes: usize) {
            self.logged.fetch_add(1, Ordering::Relaxed);
        }

        fn frame_skipped(&self, _budget: usize) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_image() -> YuyvImage {
        let width = 64u32;
        let height = 48u32;
        let data: Vec<u8> = (0..width as usize * height as usize * 2)
            .map(|i| (i * 31) as u8)
            .collect();
        YuyvImage::decode(&RawFrame::new(data, width, height)).expect("decode")
    }

    #[test]
    fn emits_one_line_per_image() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Arc::new(CountingTelemetry::default());
        let cfg = PrintConfig::default();
        let pipeline = FramePipeline::new(&cfg, None, sink.clone(), telemetry.clone());

        let (tx, rx) = sync_channel(0);
        let worker = std::thread::spawn({
            let pipeline = Arc::new(pipeline);
            move || pipeline.run(rx)
        });
        tx.send(test_image()).expect("send");
        tx.send(test_image()).expect("send");
        drop(tx);
        worker.join().expect("worker");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with(DATA_URI_PREFIX));
            assert!(line.len() <= cfg.max_log_bytes);
        }
        assert_eq!(telemetry.logged.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn no_fit_skips_frame_without_output() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Arc::new(CountingTelemetry::default());
        let cfg = PrintConfig {
            // Smaller than any possible JPEG.
            max_log_bytes: DATA_URI_PREFIX.len() + 10,
            ..PrintConfig::default()
        };
        let pipeline = FramePipeline::new(&cfg, None, sink.clone(), telemetry.clone());

        let (tx, rx) = sync_channel(0);
        let worker = std::thread::spawn({
            let pipeline = Arc::new(pipeline);
            move || pipeline.run(rx)
        });
        tx.send(test_image()).expect("send");
        drop(tx);
        worker.join().expect("worker");

        assert!(sink.lines().is_empty());
        assert_eq!(telemetry.skipped.load(Ordering::Relaxed), 1);
    }
}
