use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sink::RemoteConfig;

const DEFAULT_MODEL_PATH: &str = "models/best.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_LOG_INTERVAL: u64 = 30;
const DEFAULT_FLUSH_INTERVAL: u64 = 10;
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "video/uploads";
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

pub const ENV_CONFIG: &str = "DRONE_EDGE_CONFIG";
pub const ENV_MODEL: &str = "DRONE_EDGE_MODEL";
pub const ENV_CONFIDENCE: &str = "DRONE_EDGE_CONFIDENCE";
pub const ENV_VIDEO: &str = "DRONE_EDGE_VIDEO";
pub const ENV_OUTPUT_DIR: &str = "DRONE_EDGE_OUTPUT_DIR";
pub const ENV_API_ADDR: &str = "DRONE_EDGE_API_ADDR";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AppConfigFile {
    model: Option<ModelConfigFile>,
    video: Option<VideoConfigFile>,
    output: Option<OutputConfigFile>,
    performance: Option<PerformanceConfigFile>,
    session: Option<SessionConfigFile>,
    api: Option<ApiConfigFile>,
    remote: Option<RemoteConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    input_path: Option<String>,
    display_window: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    save_archive: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PerformanceConfigFile {
    log_fps: Option<bool>,
    log_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    flush_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    database_url: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub video: VideoSettings,
    pub output: OutputSettings,
    pub performance: PerformanceSettings,
    /// Frames between session updates sent to the sink.
    pub flush_interval: u64,
    pub api: ApiSettings,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Model file path, or a `stub://` reference.
    pub path: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub input_path: String,
    /// Accepted for compatibility; nothing is ever drawn.
    pub display_window: bool,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub save_archive: bool,
}

#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub log_fps: bool,
    /// Frames between progress lines.
    pub log_interval: u64,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub upload_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(ENV_CONFIG).ok().filter(|p| !p.trim().is_empty());
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let model = file.model.unwrap_or_default();
        let video = file.video.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let performance = file.performance.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let remote = file.remote.unwrap_or_default();
        Self {
            model: ModelSettings {
                path: model
                    .path
                    .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                confidence_threshold: model.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            },
            video: VideoSettings {
                input_path: video.input_path.unwrap_or_default(),
                display_window: video.display_window.unwrap_or(false),
            },
            output: OutputSettings {
                dir: output
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                save_archive: output.save_archive.unwrap_or(true),
            },
            performance: PerformanceSettings {
                log_fps: performance.log_fps.unwrap_or(true),
                log_interval: performance.log_interval.unwrap_or(DEFAULT_LOG_INTERVAL),
            },
            flush_interval: file
                .session
                .and_then(|session| session.flush_interval)
                .unwrap_or(DEFAULT_FLUSH_INTERVAL),
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                upload_dir: api
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            },
            remote: RemoteConfig {
                database_url: remote.database_url,
                auth_token: remote.auth_token,
                timeout: Duration::from_secs(
                    remote.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(model) = env_value(ENV_MODEL) {
            self.model.path = model;
        }
        if let Some(confidence) = env_value(ENV_CONFIDENCE) {
            self.model.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("{} must be a number in [0, 1]", ENV_CONFIDENCE))?;
        }
        if let Some(video) = env_value(ENV_VIDEO) {
            self.video.input_path = video;
        }
        if let Some(dir) = env_value(ENV_OUTPUT_DIR) {
            self.output.dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_value(ENV_API_ADDR) {
            self.api.addr = addr;
        }
        let remote_env = RemoteConfig::from_env();
        if remote_env.database_url.is_some() {
            self.remote.database_url = remote_env.database_url;
        }
        if remote_env.auth_token.is_some() {
            self.remote.auth_token = remote_env.auth_token;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.model.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "model.confidence_threshold must be in [0, 1], got {}",
                threshold
            ));
        }
        if self.model.path.trim().is_empty() {
            return Err(anyhow!("model.path must not be empty"));
        }
        if self.performance.log_interval == 0 {
            return Err(anyhow!("performance.log_interval must be greater than zero"));
        }
        if self.flush_interval == 0 {
            return Err(anyhow!("session.flush_interval must be greater than zero"));
        }
        if self.remote.timeout.is_zero() {
            return Err(anyhow!("remote.timeout_secs must be greater than zero"));
        }
        if self.video.display_window {
            log::warn!("video.display_window is set but this build never opens a display");
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
