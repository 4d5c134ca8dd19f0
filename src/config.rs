use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::detect::{BackendRegistry, DetectorBackend, StubBackend};
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::ingest::{CaptureSettings, SourceOrigin};
use crate::session::{SessionOptions, StreamMode};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_CAMERA: &str = "/dev/video0";
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "models/best.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const MIN_INPUT_SIZE: u32 = 32;
const MAX_INPUT_SIZE: u32 = 2048;
const DEFAULT_CONF_THRESHOLD: f32 = 0.6;
const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
const DEFAULT_PACING_MS: u64 = 33;
const DEFAULT_MAX_SESSIONS: usize = 8;

#[derive(Debug, Deserialize, Default)]
struct StreamdConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_sessions: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    conf_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    history_capacity: Option<usize>,
    pacing_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct StreamdConfig {
    pub api_addr: String,
    pub max_sessions: usize,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub history_capacity: usize,
    pub pacing: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device path, `stub://` camera, or a bare index (`1` = `/dev/video1`).
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl StreamdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamdConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_sessions: api.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
            camera: CameraSettings {
                device: camera.device.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                labels_path: detector.labels_path,
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                conf_threshold: detector.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            },
            history_capacity: stream
                .history_capacity
                .unwrap_or(crate::DEFAULT_HISTORY_CAPACITY),
            pacing: Duration::from_millis(stream.pacing_ms.unwrap_or(DEFAULT_PACING_MS)),
            jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("STREAMD_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(device) = std::env::var("STREAMD_CAMERA") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(backend) = std::env::var("STREAMD_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        if let Ok(path) = std::env::var("STREAMD_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Ok(max) = std::env::var("STREAMD_MAX_SESSIONS") {
            self.max_sessions = max
                .parse()
                .map_err(|_| anyhow!("STREAMD_MAX_SESSIONS must be a positive integer"))?;
        }
        if let Ok(capacity) = std::env::var("STREAMD_HISTORY_CAPACITY") {
            self.history_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("STREAMD_HISTORY_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera.device = SourceOrigin::device(&self.camera.device)
            .as_str()
            .to_string();
        if self.camera.device.is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.max_sessions == 0 {
            return Err(anyhow!("max_sessions must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("history capacity must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if !(MIN_INPUT_SIZE..=MAX_INPUT_SIZE).contains(&self.detector.input_size) {
            return Err(anyhow!(
                "detector input_size must be between {} and {}, got {}",
                MIN_INPUT_SIZE,
                MAX_INPUT_SIZE,
                self.detector.input_size
            ));
        }
        for (name, value) in [
            ("conf_threshold", self.detector.conf_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        match self.detector.backend.as_str() {
            "stub" | "tract" => Ok(()),
            other => Err(anyhow!(
                "unknown detector backend '{}' (expected stub or tract)",
                other
            )),
        }
    }

    pub fn capture(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.camera.width,
            height: self.camera.height,
            target_fps: self.camera.target_fps,
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            camera: self.camera.device.clone(),
            capture: self.capture(),
            session: SessionOptions {
                mode: StreamMode::Processed,
                pacing: self.pacing,
                jpeg_quality: self.jpeg_quality,
                max_frames: None,
            },
            max_sessions: self.max_sessions,
        }
    }

    /// Registry with the stub backend plus the configured one, which becomes
    /// the default. Loading a model happens here, once per process.
    pub fn detector_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        registry.register("stub", || {
            Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>)
        });
        if self.detector.backend == "tract" {
            register_tract(&mut registry, &self.detector)?;
        }
        registry.set_default(&self.detector.backend)?;
        registry.warm_up_default()?;
        Ok(registry)
    }
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, settings: &DetectorSettings) -> Result<()> {
    use crate::detect::{TractBackend, YoloParams};

    let mut params = YoloParams {
        input_size: settings.input_size,
        conf_threshold: settings.conf_threshold,
        iou_threshold: settings.iou_threshold,
        labels: Vec::new(),
    };
    if let Some(labels) = &settings.labels_path {
        params = params.with_labels_file(labels)?;
    }
    let loaded = TractBackend::load(&settings.model_path, params)?;
    log::info!(
        "loaded ONNX model {} ({}px input)",
        settings.model_path.display(),
        settings.input_size
    );
    registry.register("tract", move || {
        Ok(Box::new(loaded.share()) as Box<dyn DetectorBackend>)
    });
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, _settings: &DetectorSettings) -> Result<()> {
    Err(anyhow!(
        "detector backend 'tract' requires the backend-tract feature"
    ))
}

fn read_config_file(path: &Path) -> Result<StreamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
