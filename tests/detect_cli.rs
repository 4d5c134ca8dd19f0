use anyhow::Result;
use std::process::{Command, Output};
use tempfile::tempdir;

use detection_stream::{open_source, CaptureSettings, FrameSource, SourceOrigin};

const CLIP: &str = "stub://clip?frames=4&width=32&height=16";

fn run_detect(args: &[&str]) -> Result<Output> {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_detect"));
    for key in [
        "STREAMD_CONFIG",
        "STREAMD_CAMERA",
        "STREAMD_DETECTOR",
        "STREAMD_MODEL_PATH",
        "STREAMD_HISTORY_CAPACITY",
    ] {
        cmd.env_remove(key);
    }
    Ok(cmd.env("RUST_LOG", "warn").args(args).output()?)
}

#[test]
fn prints_one_line_per_detection() -> Result<()> {
    let output = run_detect(&["--file", CLIP])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 4, "{stdout}");
    assert!(lines
        .iter()
        .all(|line| *line == "Detected: object with confidence 0.90"));
    Ok(())
}

#[test]
fn raw_mode_prints_nothing() -> Result<()> {
    let output = run_detect(&["--file", CLIP, "--mode", "raw"])?;
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn saved_stream_replays_through_the_mjpeg_reader() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("annotated.mjpg");
    let path_arg = path.to_string_lossy().into_owned();
    let output = run_detect(&["--file", CLIP, "--max-frames", "3", "--output", &path_arg])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let mut source = open_source(&SourceOrigin::file(path_arg), &CaptureSettings::default())?;
    let mut frames = 0;
    while let Some(frame) = source.next_frame()? {
        assert_eq!((frame.width(), frame.height()), (32, 16));
        frames += 1;
    }
    assert_eq!(frames, 3);
    Ok(())
}

#[test]
fn conflicting_sources_are_rejected() -> Result<()> {
    let output = run_detect(&["--file", CLIP, "--camera", "0"])?;
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    Ok(())
}
