//! Printer-state gating of the capture session.
//!
//! The gate polls the printer status endpoint and starts or stops the
//! capture session on state transitions, so frames are only logged while
//! a print job is actually on the bed.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::CaptureSession;
use crate::pipeline::{FramePipeline, Telemetry};
use crate::status::StatusClient;

// Granularity of the shutdown check while waiting out the poll interval.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Whether frames should be captured in the given printer state.
///
/// PAUSED and ATTENTION count as ongoing: the job is still on the bed and
/// the failure that paused it is exactly what the log should show. Unknown
/// states are treated as not printing, so firmware additions never leave
/// the camera running unattended.
pub fn should_capture(state: &str) -> bool {
    match state {
        "PRINTING" | "PAUSED" | "ATTENTION" => true,
        "OPERATIONAL" | "FINISHED" | "IDLE" => false,
        other => {
            log::warn!("unknown printer state '{}', treating as not printing", other);
            false
        }
    }
}

/// Start/stop state machine around one capture session.
///
/// `apply` is level-triggered: it is fed the desired state every poll and
/// only acts on edges, so repeated PRINTING polls never stack sessions.
pub struct PrintGate<S: CaptureSession> {
    session: S,
    pipeline: Arc<FramePipeline>,
    worker: Option<JoinHandle<()>>,
    capturing: bool,
}

impl<S: CaptureSession> PrintGate<S> {
    pub fn new(session: S, pipeline: Arc<FramePipeline>) -> Self {
        Self {
            session,
            pipeline,
            worker: None,
            capturing: false,
        }
    }

    pub fn capturing(&self) -> bool {
        self.capturing
    }

    fn try_start(&mut self) -> Result<()> {
        let frames = self.session.start()?;
        self.worker = Some(self.pipeline.spawn(frames));
        self.capturing = true;
        Ok(())
    }

    // Stopping closes the frame channel, which ends the worker; the worker
    // keeps draining until then, so this cannot deadlock.
    fn teardown(&mut self) {
        if let Err(err) = self.session.stop() {
            log::error!("failed to stop capture: {:#}", err);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("frame worker panicked");
            }
        }
        self.capturing = false;
    }

    /// Open the session unconditionally, propagating a start failure to the
    /// caller. For ungated capture, where there is no later poll to retry.
    pub fn open(&mut self) -> Result<()> {
        self.try_start().context("start capture session")
    }

    /// Move the session towards the desired state. A failed start leaves the
    /// gate closed so the next poll retries; a failed stop is logged but the
    /// gate still closes.
    pub fn apply(&mut self, want_capture: bool) {
        // A finished worker while the gate is open means the acquisition
        // loop died. Fold the session so the next true poll restarts it.
        if self.capturing && self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            log::warn!("frame worker exited mid-session, resetting capture");
            self.teardown();
        }

        if want_capture && !self.capturing {
            match self.try_start() {
                Ok(()) => log::info!("print ongoing, capture started"),
                Err(err) => log::error!("failed to start capture, will retry: {:#}", err),
            }
        } else if !want_capture && self.capturing {
            self.teardown();
            log::info!("print over, capture stopped");
        }
    }

    /// Poll loop. Runs until `shutdown` is set, then stops any open session.
    /// A failed poll keeps the previous gate state rather than tearing down
    /// a session over a transient status hiccup.
    pub fn run(
        &mut self,
        client: &StatusClient,
        poll_interval: Duration,
        telemetry: &dyn Telemetry,
        shutdown: &AtomicBool,
    ) {
        while !shutdown.load(Ordering::SeqCst) {
            match client.poll() {
                Ok(status) => {
                    telemetry.status_poll(true);
                    self.apply(should_capture(&status.printer.state));
                }
                Err(err) => {
                    telemetry.status_poll(false);
                    log::warn!("status poll failed, keeping gate state: {:#}", err);
                }
            }
            let deadline = Instant::now() + poll_interval;
            while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(SHUTDOWN_POLL);
            }
        }
        self.apply(false);
    }

    /// Stop any open session and hand the session object back so the caller
    /// can release the underlying device.
    pub fn shutdown(mut self) -> S {
        self.apply(false);
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrintConfig;
    use crate::frame::YuyvImage;
    use crate::pipeline::{MemorySink, NoopTelemetry};
    use anyhow::{anyhow, Result};
    use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

    /// Session fake that records start/stop calls and hands out a channel
    /// that closes on stop.
    struct MockSession {
        starts: usize,
        stops: usize,
        fail_starts: usize,
        tx: Option<SyncSender<YuyvImage>>,
    }

    impl MockSession {
        fn new() -> Self {
            Self {
                starts: 0,
                stops: 0,
                fail_starts: 0,
                tx: None,
            }
        }
    }

    impl CaptureSession for MockSession {
        fn start(&mut self) -> Result<Receiver<YuyvImage>> {
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return Err(anyhow!("device busy"));
            }
            self.starts += 1;
            let (tx, rx) = sync_channel(1);
            self.tx = Some(tx);
            Ok(rx)
        }

        fn stop(&mut self) -> Result<()> {
            self.stops += 1;
            self.tx = None;
            Ok(())
        }
    }

    fn gate(session: MockSession) -> PrintGate<MockSession> {
        let pipeline = Arc::new(FramePipeline::new(
            &PrintConfig::default(),
            None,
            Arc::new(MemorySink::new()),
            Arc::new(NoopTelemetry),
        ));
        PrintGate::new(session, pipeline)
    }

    #[test]
    fn one_session_per_print() {
        let mut gate = gate(MockSession::new());
        for state in ["IDLE", "PRINTING", "PRINTING", "PAUSED", "FINISHED"] {
            gate.apply(should_capture(state));
        }
        assert_eq!(gate.session.starts, 1);
        assert_eq!(gate.session.stops, 1);
        assert!(!gate.capturing());
    }

    #[test]
    fn rapid_toggling_pairs_start_and_stop() {
        let mut gate = gate(MockSession::new());
        for state in ["PRINTING", "IDLE", "ATTENTION", "OPERATIONAL", "PRINTING"] {
            gate.apply(should_capture(state));
        }
        assert_eq!(gate.session.starts, 3);
        assert_eq!(gate.session.stops, 2);
        assert!(gate.capturing());
        gate.shutdown();
    }

    #[test]
    fn failed_start_retries_next_poll() {
        let mut session = MockSession::new();
        session.fail_starts = 1;
        let mut gate = gate(session);
        gate.apply(true);
        assert!(!gate.capturing());
        gate.apply(true);
        assert!(gate.capturing());
        assert_eq!(gate.session.starts, 1);
        gate.shutdown();
    }

    #[test]
    fn open_propagates_start_failure() {
        let mut session = MockSession::new();
        session.fail_starts = 1;
        let mut gate = gate(session);
        assert!(gate.open().is_err());
        assert!(!gate.capturing());
        gate.open().expect("open");
        assert!(gate.capturing());
        gate.shutdown();
    }

    #[test]
    fn dead_worker_resets_gate_and_restarts() {
        let mut gate = gate(MockSession::new());
        gate.apply(true);
        assert!(gate.capturing());

        // Drop the sender, as the acquisition loop does on a fatal error,
        // and let the worker drain out.
        gate.session.tx = None;
        let worker_done = || gate.worker.as_ref().map_or(true, |w| w.is_finished());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !worker_done() {
            assert!(std::time::Instant::now() < deadline, "worker never exited");
            std::thread::sleep(Duration::from_millis(1));
        }

        gate.apply(true);
        assert!(gate.capturing());
        assert_eq!(gate.session.starts, 2);
        assert_eq!(gate.session.stops, 1);
        gate.shutdown();
    }

    #[test]
    fn unknown_states_do_not_capture() {
        assert!(!should_capture("BUSY"));
        assert!(!should_capture(""));
        assert!(!should_capture("printing"));
    }

    #[test]
    fn state_mapping() {
        for state in ["PRINTING", "PAUSED", "ATTENTION"] {
            assert!(should_capture(state), "{} should capture", state);
        }
        for state in ["OPERATIONAL", "FINISHED", "IDLE"] {
            assert!(!should_capture(state), "{} should not capture", state);
        }
    }
}
