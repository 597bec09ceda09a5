//! printlgtm
//!
//! This crate watches a 3D printer through a camera and writes what it sees
//! into the logging pipeline, one frame per log line, plus the offline tool
//! that turns those lines back into timelapse videos.
//!
//! # Pipeline
//!
//! 1. **Capture**: a `FrameSource` (V4L2 or synthetic) streams packed YUYV
//!    frames; `SampledCapture` thins them to one per sampling interval and
//!    publishes decoded images over an unbuffered channel.
//! 2. **Gate**: `PrintGate` polls the printer status endpoint and only keeps
//!    a capture session open while a print job is ongoing.
//! 3. **Annotate** (optional): detections from the failure-detection service
//!    are drawn onto the frame.
//! 4. **Encode**: `AdaptiveEncoder` walks a fixed resolution ladder and picks
//!    the tallest JPEG that fits the log-line byte budget.
//! 5. **Log**: each frame goes out as one `data:image/jpeg;base64,` line.
//!
//! # Module Structure
//!
//! - `frame`: raw YUYV frames and plane decoding
//! - `capture`: device sources and the sampled acquisition loop
//! - `encode`: ladder-based fit-to-budget JPEG encoding
//! - `gate`: printer-state gating of the capture session
//! - `status` / `detect`: PrusaLink status and ML detection clients
//! - `pipeline`: the per-session encode/log worker
//! - `logline`: the data-URI log line format
//! - `timelapse`: Loki retrieval and MJPEG AVI reconstruction

pub mod capture;
pub mod config;
pub mod detect;
pub mod encode;
pub mod frame;
pub mod gate;
pub mod logline;
pub mod pipeline;
pub mod status;
pub mod timelapse;

pub use capture::{
    open_source, CaptureSession, FrameSource, FrameWait, SampledCapture, SyntheticFrameSource,
    FRAME_WAIT_TIMEOUT,
};
#[cfg(feature = "capture-v4l2")]
pub use capture::V4l2FrameSource;
pub use config::{CaptureConfig, Config, PixelFormat, PrintConfig};
pub use detect::{DetectedFailure, FailureDetector};
pub use encode::{AdaptiveEncoder, EncodedFrame, FitError, SIZE_LADDER};
pub use frame::{RawFrame, YuyvImage};
pub use gate::{should_capture, PrintGate};
pub use logline::{decode_line, encode_line, DATA_URI_PREFIX};
pub use pipeline::{
    FramePipeline, LogSink, LogTelemetry, MemorySink, NoopTelemetry, StdoutSink, Telemetry,
};
pub use status::{PrinterStatus, StatusClient};
pub use timelapse::{AviWriter, LokiClient, TimelapseBuilder};
