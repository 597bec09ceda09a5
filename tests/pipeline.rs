//! End-to-end run against the synthetic source: capture, sample, encode,
//! and emit, then check the emitted lines hold real JPEGs under the budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use printlgtm::{
    decode_line, open_source, CaptureConfig, FramePipeline, MemorySink, NoopTelemetry,
    PrintConfig, SampledCapture, DATA_URI_PREFIX,
};

#[test]
fn synthetic_capture_emits_decodable_frame_lines() {
    let camera = CaptureConfig {
        device: "stub://bench".to_string(),
        frame_width: 64,
        frame_height: 48,
        frame_rate: 30,
        sample_interval: Duration::from_millis(50),
        ..CaptureConfig::default()
    };
    let print = PrintConfig::default();

    let source = open_source(&camera).expect("open synthetic source");
    let mut capture = SampledCapture::new(source, camera);

    let sink = Arc::new(MemorySink::new());
    let pipeline = Arc::new(FramePipeline::new(
        &print,
        None,
        sink.clone(),
        Arc::new(NoopTelemetry),
    ));

    let frames = capture.start().expect("start capture");
    let worker = pipeline.spawn(frames);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.lines().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    capture.stop().expect("stop capture");
    worker.join().expect("worker");

    let lines = sink.lines();
    assert!(lines.len() >= 2, "expected at least 2 lines, got {}", lines.len());

    for line in &lines {
        assert!(line.starts_with(DATA_URI_PREFIX));
        assert!(line.len() <= print.max_log_bytes);

        let jpeg = decode_line(line)
            .expect("line is a frame line")
            .expect("payload is valid base64");
        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .expect("payload is a valid JPEG");
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }
}

#[test]
fn capture_session_restarts_cleanly() {
    let camera = CaptureConfig {
        device: "stub://bench".to_string(),
        frame_width: 32,
        frame_height: 24,
        frame_rate: 30,
        sample_interval: Duration::from_millis(30),
        ..CaptureConfig::default()
    };
    let print = PrintConfig::default();

    let source = open_source(&camera).expect("open synthetic source");
    let mut capture = SampledCapture::new(source, camera);
    let sink = Arc::new(MemorySink::new());
    let pipeline = Arc::new(FramePipeline::new(
        &print,
        None,
        sink.clone(),
        Arc::new(NoopTelemetry),
    ));

    for _ in 0..2 {
        let frames = capture.start().expect("start capture");
        let worker = pipeline.spawn(frames);

        let deadline = Instant::now() + Duration::from_secs(5);
        let seen = sink.lines().len();
        while sink.lines().len() <= seen && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        capture.stop().expect("stop capture");
        worker.join().expect("worker");
    }

    assert!(sink.lines().len() >= 2);
}
