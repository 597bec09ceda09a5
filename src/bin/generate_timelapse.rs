//! generate_timelapse - rebuild timelapse videos from logged frames
//!
//! Queries Loki for the daemon's frame lines over a time range and packs the
//! JPEGs into MJPEG AVI files, one per print job. A gap in the log separates
//! jobs. With --encode-to-mp4 each finished file is re-encoded via ffmpeg.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

use printlgtm::timelapse::{reconstruct, LokiClient, TimelapseBuilder};

const DEFAULT_QUERY: &str = r#"{unit="printlgtm.service"} |= "base64""#;

#[derive(Parser, Debug)]
#[command(name = "generate_timelapse", about = "Rebuild timelapse videos from logged frames")]
struct Args {
    /// Loki base URL
    #[arg(long)]
    loki_url: String,

    /// Username for the Loki API
    #[arg(long)]
    loki_username: Option<String>,

    /// Password for the Loki API
    #[arg(long, env = "PRINTLGTM_LOKI_PASSWORD")]
    loki_password: Option<String>,

    /// LogQL query selecting the frame lines
    #[arg(long, default_value = DEFAULT_QUERY)]
    logql_query: String,

    /// Start of the range, RFC 3339 (e.g. 2024-03-01T00:00:00Z)
    #[arg(long)]
    start_time: DateTime<Utc>,

    /// End of the range, RFC 3339
    #[arg(long)]
    end_time: DateTime<Utc>,

    /// Re-encode finished files to MP4 (requires ffmpeg)
    #[arg(long)]
    encode_to_mp4: bool,

    /// Directory the video files are written to
    #[arg(long, default_value = "videos/")]
    output_path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.end_time <= args.start_time {
        anyhow::bail!("end time must be after start time");
    }
    std::fs::create_dir_all(&args.output_path)
        .with_context(|| format!("failed to create {}", args.output_path.display()))?;

    let client = LokiClient::new(
        &args.loki_url,
        &args.logql_query,
        args.loki_username.as_deref(),
        args.loki_password.as_deref(),
    )?;
    let mut builder = TimelapseBuilder::new(&args.output_path, args.encode_to_mp4);

    reconstruct(&client, args.start_time, args.end_time, &mut builder)?;
    let produced = builder.finish()?;

    if produced == 0 {
        log::warn!(
            "no timelapses produced between {} and {} for query {}",
            args.start_time,
            args.end_time,
            args.logql_query
        );
    } else {
        log::info!("{} timelapse file(s) written to {}", produced, args.output_path.display());
    }
    Ok(())
}
