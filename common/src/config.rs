use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// "onnx", "stub" or "none".
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
}

/// Frame stream tuning. File and live sources trade latency for throughput
/// differently, so each gets its own skip interval.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_file_skip_interval")]
    pub file_skip_interval: u64,
    #[serde(default = "default_live_skip_interval")]
    pub live_skip_interval: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_file_frame_delay_ms")]
    pub file_frame_delay_ms: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_capture_quality")]
    pub capture_quality: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionConfig {
    #[serde(default = "default_simulate_drift")]
    pub simulate_drift: bool,
    #[serde(default = "default_start_lat")]
    pub start_lat: f64,
    #[serde(default = "default_start_lon")]
    pub start_lon: f64,
    #[serde(default = "default_drift_step")]
    pub drift_step: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model_path: default_model_path(),
            input_size: default_input_size(),
            confidence: default_confidence(),
            max_detections: default_max_detections(),
            iou_threshold: default_iou_threshold(),
            class_names: default_class_names(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            file_skip_interval: default_file_skip_interval(),
            live_skip_interval: default_live_skip_interval(),
            jpeg_quality: default_jpeg_quality(),
            file_frame_delay_ms: default_file_frame_delay_ms(),
            ffmpeg_path: default_ffmpeg_path(),
            capture_quality: default_capture_quality(),
        }
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            simulate_drift: default_simulate_drift(),
            start_lat: default_start_lat(),
            start_lon: default_start_lon(),
            drift_step: default_drift_step(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.file_skip_interval == 0 || self.stream.live_skip_interval == 0 {
            return Err(ConfigError::Invalid(
                "stream skip intervals must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        let conf = self.detector.confidence;
        if !(conf > 0.0 && conf <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detector.confidence must be within (0, 1], got {conf}"
            )));
        }
        if self.detector.input_size == 0 {
            return Err(ConfigError::Invalid("detector.input_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_upload_dir() -> PathBuf {
    std::env::temp_dir().join("roadwatch_uploads")
}
fn default_max_upload_mb() -> usize {
    10
}
fn default_backend() -> String {
    "onnx".into()
}
fn default_model_path() -> PathBuf {
    PathBuf::from("best.onnx")
}
fn default_input_size() -> u32 {
    640
}
fn default_confidence() -> f32 {
    0.35
}
fn default_max_detections() -> usize {
    50
}
fn default_iou_threshold() -> f32 {
    0.45
}
fn default_class_names() -> Vec<String> {
    [
        "Longitudinal Crack",
        "Transverse Crack",
        "Alligator Crack",
        "Other Corruption",
        "Pothole",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_file_skip_interval() -> u64 {
    5
}
fn default_live_skip_interval() -> u64 {
    10
}
fn default_jpeg_quality() -> u8 {
    75
}
fn default_file_frame_delay_ms() -> u64 {
    10
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_capture_quality() -> u32 {
    3
}
fn default_simulate_drift() -> bool {
    true
}
fn default_start_lat() -> f64 {
    40.7128
}
fn default_start_lon() -> f64 {
    -74.0060
}
fn default_drift_step() -> f64 {
    0.00001
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/scans.db")
}
fn default_log_level() -> String {
    "info".into()
}
