//! Configuration loader and validator for the brigade sync subsystem.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub backend: Backend,
    pub upload: Upload,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Delay between queue items in a drain pass; keeps a just-recovered
    /// weak connection from being saturated.
    pub sync_pacing_ms: u64,
    /// Queue rounds before an item is dropped.
    pub max_retry_rounds: u32,
}

/// REST backend settings (signing, status and batch-reference endpoints).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub base_url: String,
    pub token: String,
    pub timeout_seconds: u64,
}

/// Per-file upload retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upload {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_video_bytes: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.app.sync_pacing_ms)
    }

    pub fn retry(&self) -> crate::upload::RetryConfig {
        crate::upload::RetryConfig {
            max_attempts: self.upload.max_attempts,
            initial_delay: Duration::from_millis(self.upload.initial_delay_ms),
            max_delay: Duration::from_millis(self.upload.max_delay_ms),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_retry_rounds == 0 {
        return Err(ConfigError::Invalid("app.max_retry_rounds must be > 0"));
    }

    if cfg.backend.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.base_url must be non-empty"));
    }
    if cfg.backend.token.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.token must be non-empty"));
    }
    if cfg.backend.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("backend.timeout_seconds must be > 0"));
    }

    if cfg.upload.max_attempts == 0 {
        return Err(ConfigError::Invalid("upload.max_attempts must be > 0"));
    }
    if cfg.upload.max_delay_ms < cfg.upload.initial_delay_ms {
        return Err(ConfigError::Invalid(
            "upload.max_delay_ms must be >= upload.initial_delay_ms",
        ));
    }
    if cfg.upload.max_video_bytes == 0 {
        return Err(ConfigError::Invalid("upload.max_video_bytes must be > 0"));
    }

    Ok(())
}

/// Default YAML content, used for bootstrapping a deployment.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_pacing_ms: 1000
  max_retry_rounds: 3

backend:
  base_url: "https://api.example.org/api"
  token: "YOUR_SESSION_TOKEN"
  timeout_seconds: 60

upload:
  max_attempts: 3
  initial_delay_ms: 1000
  max_delay_ms: 10000
  max_video_bytes: 10485760
"#
}
