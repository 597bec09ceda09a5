//! printlgtmd - camera capture daemon
//!
//! This daemon:
//! 1. Polls the printer status endpoint and opens a capture session while a
//!    print job is ongoing (or captures continuously if none is configured)
//! 2. Streams YUYV frames from the camera, one kept per sampling interval
//! 3. Optionally annotates frames with ML-detected print failures
//! 4. Fits each frame under the log-line byte budget and writes it to stdout
//!    as one `data:image/jpeg;base64,` line

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use printlgtm::{
    config, open_source, Config, FailureDetector, FramePipeline, LogTelemetry, PrintGate,
    SampledCapture, StatusClient, StdoutSink, Telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "printlgtmd", about = "Log a 3D print as one JPEG frame per log line")]
struct Args {
    /// Camera device path, or stub://... for a synthetic source
    #[arg(long)]
    device: Option<String>,

    /// Printer status endpoint; without it, capture runs continuously
    #[arg(long)]
    status_url: Option<String>,

    /// Failure-detection service endpoint
    #[arg(long)]
    ml_api_url: Option<String>,

    /// API key sent to the printer status endpoint
    #[arg(long, env = "PRINTLGTM_API_KEY")]
    api_key: Option<String>,

    /// Seconds between kept frames
    #[arg(long)]
    sample_interval_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = Config::load()?;
    if let Some(device) = args.device {
        cfg.camera.device = device;
    }
    if let Some(url) = args.status_url {
        cfg.print.printer_status_url = Some(url);
    }
    if let Some(url) = args.ml_api_url {
        cfg.print.ml_api_url = Some(url);
    }
    if let Some(secs) = args.sample_interval_secs {
        cfg.camera.sample_interval = Duration::from_secs(secs);
    }
    config::validate_capture(&cfg.camera)?;
    config::validate_print(&cfg.print)?;

    let source = open_source(&cfg.camera)?;
    let capture = SampledCapture::new(source, cfg.camera.clone());

    let detector = match &cfg.print.ml_api_url {
        Some(url) => Some(FailureDetector::new(url)?),
        None => None,
    };
    let telemetry: Arc<dyn Telemetry> = Arc::new(LogTelemetry);
    let pipeline = Arc::new(FramePipeline::new(
        &cfg.print,
        detector,
        Arc::new(StdoutSink),
        Arc::clone(&telemetry),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    log::info!(
        "printlgtmd running. device={}, sample interval={}s, budget={} bytes",
        cfg.camera.device,
        cfg.camera.sample_interval.as_secs(),
        cfg.print.max_log_bytes
    );

    let client = match &cfg.print.printer_status_url {
        Some(url) => {
            log::info!("gating capture on printer status at {}", url);
            Some(StatusClient::new(url, args.api_key)?)
        }
        None => None,
    };

    let mut gate = PrintGate::new(capture, pipeline);
    let outcome = match &client {
        Some(client) => {
            gate.run(client, cfg.print.poll_interval, telemetry.as_ref(), &shutdown);
            Ok(())
        }
        None => {
            log::info!("no status endpoint configured, capturing continuously");
            // Without a poll loop there is no later retry, so a start
            // failure here is fatal.
            let started = gate.open();
            if started.is_ok() {
                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
            started
        }
    };

    gate.shutdown()
        .close()
        .context("release capture device")?;
    outcome?;

    log::info!("printlgtmd stopped");
    Ok(())
}
