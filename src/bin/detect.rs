//! detect - run the detector over a video file or camera from the terminal
//!
//! Prints one line per detection and optionally saves the annotated stream
//! as a concatenated-JPEG file that `streamd` can replay.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use detection_stream::config::StreamdConfig;
use detection_stream::session::{SessionOptions, StreamMode, StreamingSession};
use detection_stream::{DetectionHistory, SourceOrigin};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video file to process. The camera is used when absent.
    #[arg(long, conflicts_with = "camera")]
    file: Option<String>,
    /// Camera device path or index (overrides STREAMD_CAMERA).
    #[arg(long)]
    camera: Option<String>,
    /// raw or processed.
    #[arg(long, default_value = "processed")]
    mode: StreamMode,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Write the output stream to this file (.mjpg).
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Play files back at ~30 fps instead of as fast as possible.
    #[arg(long)]
    realtime: bool,
    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = StreamdConfig::load()?;
    let origin = match (&args.file, &args.camera) {
        (Some(path), _) => SourceOrigin::file(path.clone()),
        (None, Some(device)) => SourceOrigin::device(device),
        (None, None) => SourceOrigin::device(&config.camera.device),
    };
    if origin.is_live() {
        log::info!("running inference on camera {}", origin.as_str());
    } else {
        log::info!("running inference on video file {}", origin.as_str());
    }

    let detector = match args.mode {
        StreamMode::Raw => None,
        StreamMode::Processed => Some(config.detector_registry()?.create_default()?),
    };
    let options = SessionOptions {
        mode: args.mode,
        pacing: if args.realtime {
            config.pacing
        } else {
            Duration::ZERO
        },
        jpeg_quality: config.jpeg_quality,
        max_frames: args.max_frames,
    };
    let capture = config.capture();

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_handler.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let history = DetectionHistory::new(config.history_capacity);
    let mut session = StreamingSession::open(&origin, &capture, options, history, detector)?
        .with_cancel(cancel)
        .on_detections(|_frame, detections| {
            for detection in detections {
                println!(
                    "Detected: {} with confidence {:.2}",
                    detection.label, detection.confidence
                );
            }
        });

    let mut sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(io::sink()),
    };
    let report = session.run(&mut sink)?;
    sink.flush()?;

    log::info!(
        "stream ended ({}): {} frames, {} detections",
        report.end,
        report.frames_emitted,
        report.detections_recorded
    );
    if let Some(path) = &args.output {
        log::info!("annotated stream written to {}", path.display());
    }
    Ok(())
}
