//! failure_detect - one-shot failure detection against a JPEG file
//!
//! Sends the image to the ML service, prints each detection, and can write
//! an annotated copy with the bounding boxes drawn in.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use printlgtm::detect::annotate;
use printlgtm::encode::encode_jpeg;
use printlgtm::FailureDetector;

#[derive(Parser, Debug)]
#[command(name = "failure_detect", about = "Detect print failures in a JPEG image")]
struct Args {
    /// Failure-detection service endpoint
    #[arg(long)]
    ml_api_url: String,

    /// JPEG image to check
    #[arg(long)]
    image_path: PathBuf,

    /// Where to write an annotated copy, if detections are found
    #[arg(long)]
    annotated_output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let jpeg = std::fs::read(&args.image_path)
        .with_context(|| format!("failed to read {}", args.image_path.display()))?;
    let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
        .with_context(|| format!("{} is not a valid JPEG", args.image_path.display()))?;

    let detector = FailureDetector::new(&args.ml_api_url)?;
    let failures = detector.detect(&jpeg)?;

    for failure in &failures {
        println!(
            "Failure detected with confidence {} at coordinates {:?}",
            failure.confidence, failure.bbox
        );
    }

    if let (Some(output), false) = (&args.annotated_output, failures.is_empty()) {
        let mut rgb = image.to_rgb8();
        annotate(&mut rgb, &failures);
        let annotated = encode_jpeg(&rgb, 100).context("failed to encode annotated image")?;
        std::fs::write(output, annotated)
            .with_context(|| format!("failed to write {}", output.display()))?;
        log::info!("annotated image written to {}", output.display());
    }

    Ok(())
}
