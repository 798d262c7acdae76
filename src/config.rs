use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::NORMAL_LABEL;
use crate::ingest::{SourceDescriptor, SourceSettings};
use crate::notify::MqttSettings;
use crate::pipeline::PipelineConfig;
use crate::CameraId;

const DEFAULT_DB_PATH: &str = "crimewatch.db";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_CAMERA_SOURCE: &str = "stub://front_camera";
const DEFAULT_CAPTURE_FPS: u32 = 30;
const DEFAULT_READ_FAILURE_CEILING: u32 = 50;
const DEFAULT_READ_BACKOFF_MS: u64 = 100;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_INFERENCE_INTERVAL_MS: u64 = 1500;
const DEFAULT_ALERT_THRESHOLD: f32 = 0.80;
const DEFAULT_DISPLAY_FLOOR: f32 = 0.20;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_WINDOW_SIZE: usize = 16;
const DEFAULT_INPUT_SIZE: u32 = 224;
const DEFAULT_REQUIRED_STABILITY: u32 = 1;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_STREAM_FPS: u32 = 15;
const DEFAULT_STREAM_POLL_MS: u64 = 50;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2000;
const SUPPORTED_BACKENDS: &[&str] = &["stub", "tract"];

#[derive(Debug, Deserialize, Default)]
struct WatchConfigFile {
    db_path: Option<String>,
    snapshot_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    capture: Option<CaptureConfigFile>,
    inference: Option<InferenceConfigFile>,
    alerts: Option<AlertsConfigFile>,
    stream: Option<StreamConfigFile>,
    notify: Option<NotifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: CameraId,
    name: Option<String>,
    source: String,
    active: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    target_fps: Option<u32>,
    read_failure_ceiling: Option<u32>,
    read_backoff_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    interval_ms: Option<u64>,
    alert_threshold: Option<f32>,
    display_floor: Option<f32>,
    normal_label: Option<String>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    window_size: Option<usize>,
    input_size: Option<u32>,
    labels: Option<Vec<String>>,
    stub_motion_label: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    required_stability: Option<u32>,
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    fps: Option<u32>,
    poll_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    mqtt: Option<MqttConfigFile>,
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub api_addr: String,
    pub cameras: Vec<CameraConfig>,
    pub capture: CaptureSettings,
    pub inference: InferenceSettings,
    pub alerts: AlertSettings,
    pub stream: StreamSettings,
    pub notify: NotifySettings,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub name: String,
    pub source: String,
    pub active: bool,
}

impl CameraConfig {
    pub fn descriptor(&self) -> Result<SourceDescriptor> {
        SourceDescriptor::parse(&self.source)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub read_failure_ceiling: u32,
    pub read_backoff: Duration,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub interval: Duration,
    pub alert_threshold: f32,
    pub display_floor: f32,
    pub normal_label: String,
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub window_size: usize,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub labels: Vec<String>,
    /// Label the stub backend reports for clips with motion. Unset keeps it normal.
    pub stub_motion_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub required_stability: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub fps: u32,
    pub poll: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
    pub mqtt: Option<MqttSettings>,
    pub webhook_url: Option<String>,
}

impl WatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CRIMEWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults only; no file and no environment.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(WatchConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, still honoring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let snapshot_dir = file
            .snapshot_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR));
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|camera| CameraConfig {
                    name: camera
                        .name
                        .unwrap_or_else(|| format!("Camera {}", camera.id)),
                    id: camera.id,
                    source: camera.source,
                    active: camera.active.unwrap_or(true),
                })
                .collect(),
            None => vec![CameraConfig {
                id: 1,
                name: "Front Camera".to_string(),
                source: DEFAULT_CAMERA_SOURCE.to_string(),
                active: true,
            }],
        };

        let capture = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            read_failure_ceiling: capture
                .read_failure_ceiling
                .unwrap_or(DEFAULT_READ_FAILURE_CEILING),
            read_backoff: Duration::from_millis(
                capture.read_backoff_ms.unwrap_or(DEFAULT_READ_BACKOFF_MS),
            ),
            width: capture.width.unwrap_or(DEFAULT_WIDTH),
            height: capture.height.unwrap_or(DEFAULT_HEIGHT),
        };

        let inference = file.inference.unwrap_or_default();
        let inference = InferenceSettings {
            interval: Duration::from_millis(
                inference
                    .interval_ms
                    .unwrap_or(DEFAULT_INFERENCE_INTERVAL_MS),
            ),
            alert_threshold: inference.alert_threshold.unwrap_or(DEFAULT_ALERT_THRESHOLD),
            display_floor: inference.display_floor.unwrap_or(DEFAULT_DISPLAY_FLOOR),
            normal_label: inference
                .normal_label
                .unwrap_or_else(|| NORMAL_LABEL.to_string()),
            backend: inference
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: inference.model_path,
            window_size: inference.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
            input_size: inference.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            labels: inference.labels.unwrap_or_else(|| {
                crate::classify::UCF_CRIME_LABELS
                    .iter()
                    .map(|label| label.to_string())
                    .collect()
            }),
            stub_motion_label: inference.stub_motion_label,
        };

        let alerts = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            required_stability: alerts
                .required_stability
                .unwrap_or(DEFAULT_REQUIRED_STABILITY),
            cooldown: Duration::from_secs(alerts.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
        };

        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            fps: stream.fps.unwrap_or(DEFAULT_STREAM_FPS),
            poll: Duration::from_millis(stream.poll_ms.unwrap_or(DEFAULT_STREAM_POLL_MS)),
            stop_timeout: Duration::from_millis(
                stream.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
        };

        let notify = file.notify.unwrap_or_default();
        let mqtt = notify.mqtt.and_then(|mqtt| {
            let broker = mqtt.broker?;
            let mut settings = MqttSettings::new(broker);
            if let Some(prefix) = mqtt.topic_prefix {
                settings.topic_prefix = prefix;
            }
            if let Some(client_id) = mqtt.client_id {
                settings.client_id = client_id;
            }
            settings.username = mqtt.username;
            settings.password = mqtt.password;
            Some(settings)
        });
        let notify = NotifySettings {
            mqtt,
            webhook_url: notify.webhook_url,
        };

        Ok(Self {
            db_path,
            snapshot_dir,
            api_addr,
            cameras,
            capture,
            inference,
            alerts,
            stream,
            notify,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("CRIMEWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_nonempty("CRIMEWATCH_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_nonempty("CRIMEWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(backend) = env_nonempty("CRIMEWATCH_BACKEND") {
            self.inference.backend = backend;
        }
        if let Some(path) = env_nonempty("CRIMEWATCH_MODEL_PATH") {
            self.inference.model_path = Some(PathBuf::from(path));
        }
        if let Some(labels) = env_nonempty("CRIMEWATCH_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.inference.labels = parsed;
            }
        }
        if let Some(label) = env_nonempty("CRIMEWATCH_STUB_MOTION_LABEL") {
            self.inference.stub_motion_label = Some(label);
        }
        if let Some(threshold) = env_nonempty("CRIMEWATCH_ALERT_THRESHOLD") {
            self.inference.alert_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("CRIMEWATCH_ALERT_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Some(stability) = env_nonempty("CRIMEWATCH_REQUIRED_STABILITY") {
            self.alerts.required_stability = stability.trim().parse().map_err(|_| {
                anyhow!("CRIMEWATCH_REQUIRED_STABILITY must be a positive integer")
            })?;
        }
        if let Some(cooldown) = env_nonempty("CRIMEWATCH_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("CRIMEWATCH_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alerts.cooldown = Duration::from_secs(seconds);
        }
        if let Some(broker) = env_nonempty("CRIMEWATCH_MQTT_BROKER") {
            match self.notify.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker = broker,
                None => self.notify.mqtt = Some(MqttSettings::new(broker)),
            }
        }
        if let Some(url) = env_nonempty("CRIMEWATCH_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        check_unit_interval("inference.alert_threshold", self.inference.alert_threshold)?;
        check_unit_interval("inference.display_floor", self.inference.display_floor)?;
        if self.inference.window_size == 0 {
            return Err(anyhow!("inference.window_size must be greater than zero"));
        }
        if self.inference.interval.is_zero() {
            return Err(anyhow!("inference.interval_ms must be greater than zero"));
        }
        if self.inference.normal_label.trim().is_empty() {
            return Err(anyhow!("inference.normal_label must not be empty"));
        }
        self.inference.stub_motion_label = self
            .inference
            .stub_motion_label
            .take()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty());
        self.inference.backend = self.inference.backend.trim().to_lowercase();
        if !SUPPORTED_BACKENDS.contains(&self.inference.backend.as_str()) {
            return Err(anyhow!(
                "unsupported inference backend '{}' (expected one of {})",
                self.inference.backend,
                SUPPORTED_BACKENDS.join(", ")
            ));
        }
        if self.inference.backend == "tract" {
            if self.inference.model_path.is_none() {
                return Err(anyhow!("inference.model_path is required for the tract backend"));
            }
            if self.inference.labels.is_empty() {
                return Err(anyhow!("inference.labels must not be empty for the tract backend"));
            }
        }
        if self.alerts.required_stability == 0 {
            return Err(anyhow!("alerts.required_stability must be at least 1"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture.target_fps must be greater than zero"));
        }
        if self.capture.read_failure_ceiling == 0 {
            return Err(anyhow!("capture.read_failure_ceiling must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture.width and capture.height must be non-zero"));
        }
        if self.stream.fps == 0 {
            return Err(anyhow!("stream.fps must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            camera
                .descriptor()
                .map_err(|e| anyhow!("camera {}: {}", camera.id, e))?;
        }
        Ok(())
    }

    /// Catalog entry for `camera_id`, only if it exists and is active.
    pub fn active_camera(&self, camera_id: CameraId) -> Option<&CameraConfig> {
        self.cameras
            .iter()
            .find(|camera| camera.id == camera_id && camera.active)
    }

    pub fn active_cameras(&self) -> Vec<CameraConfig> {
        self.cameras
            .iter()
            .filter(|camera| camera.active)
            .cloned()
            .collect()
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            target_fps: self.capture.target_fps,
            width: self.capture.width,
            height: self.capture.height,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            target_fps: self.capture.target_fps,
            read_failure_ceiling: self.capture.read_failure_ceiling,
            read_backoff: self.capture.read_backoff,
            inference_interval: self.inference.interval,
            alert_threshold: self.inference.alert_threshold,
            display_floor: self.inference.display_floor,
            normal_label: self.inference.normal_label.clone(),
            required_stability: self.alerts.required_stability,
            cooldown: self.alerts.cooldown,
            stream_fps: self.stream.fps,
            stream_poll: self.stream.poll,
            stop_timeout: self.stream.stop_timeout,
            ..PipelineConfig::default()
        }
    }
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<WatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
