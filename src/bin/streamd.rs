//! streamd - detection streaming service
//!
//! This daemon:
//! 1. Loads configuration (STREAMD_CONFIG file + STREAMD_* overrides)
//! 2. Loads the configured detector backend once
//! 3. Serves camera and file streams plus the detection history over HTTP

use anyhow::Result;
use std::sync::mpsc;

use detection_stream::{api::ApiServer, config::StreamdConfig, DetectionHistory};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StreamdConfig::load()?;
    let registry = config.detector_registry()?;
    let history = DetectionHistory::new(config.history_capacity);

    let api_handle = ApiServer::new(config.api_config(), history, registry).spawn()?;
    log::info!(
        "streamd running: camera {} ({}x{}@{}), detector {}, history {}",
        config.camera.device,
        config.camera.width,
        config.camera.height,
        config.camera.target_fps,
        config.detector.backend,
        config.history_capacity
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("streamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;

    Ok(())
}
