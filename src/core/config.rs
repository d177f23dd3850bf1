use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::media::TransportKind;

const APP_CONFIG_DIR: &str = "AudioRoom";
const APP_CONFIG_FILE: &str = "config.json";
const DEV_CONFIG_FILE: &str = "dev-config.json";
const DEV_CONFIG_ENV: &str = "AUDIO_ROOM_DEV_CONFIG";

pub const DEFAULT_DEMO_GROUP_NAME: &str = "hifi-demo";
pub const DEFAULT_SIGNALING_URL: &str = "wss://localhost/token-server";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_demo_group_name")]
    pub demo_group_name: String,
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_noise_gate_threshold")]
    pub noise_gate_threshold: f32,
    #[serde(default = "default_local_sources_enabled")]
    pub local_sources_enabled: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            demo_group_name: default_demo_group_name(),
            signaling_url: default_signaling_url(),
            transport: default_transport(),
            noise_gate_threshold: default_noise_gate_threshold(),
            local_sources_enabled: default_local_sources_enabled(),
            request_timeout_ms: default_request_timeout_ms(),
            assets_dir: default_assets_dir(),
        }
    }
}

impl ClientConfig {
    /// Group name sent with `get-channel-prefix`; blank falls back to the
    /// demo group.
    pub fn group_name(&self) -> &str {
        let trimmed = self.demo_group_name.trim();
        if trimmed.is_empty() {
            DEFAULT_DEMO_GROUP_NAME
        } else {
            trimmed
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ClientConfig,
    pub path: PathBuf,
    pub is_dev_override: bool,
}

impl LoadedConfig {
    /// A config that lives only in memory and is never written back.
    pub fn ephemeral(config: ClientConfig) -> Self {
        Self {
            config,
            path: PathBuf::new(),
            is_dev_override: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to resolve config base directory")]
    NoConfigDirectory,
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write config file {path}: {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },
}

pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    if let Some(dev_path) = find_dev_config() {
        let config = read_config(&dev_path)?;
        return Ok(LoadedConfig {
            config,
            path: dev_path,
            is_dev_override: true,
        });
    }

    load_config_from_path(persistent_config_path()?)
}

/// Reads `path`, creating it with defaults when it does not exist yet.
pub fn load_config_from_path(path: PathBuf) -> Result<LoadedConfig, ConfigError> {
    if path.exists() {
        let config = read_config(&path)?;
        return Ok(LoadedConfig {
            config,
            path,
            is_dev_override: false,
        });
    }

    let config = ClientConfig::default();
    save_config_to_path(&path, &config)?;

    Ok(LoadedConfig {
        config,
        path,
        is_dev_override: false,
    })
}

pub fn save_config_to_path(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).map_err(|source| ConfigError::WriteFile {
        path: path.display().to_string(),
        source,
    })
}

pub fn persistent_config_path() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDirectory)?;
    Ok(base_dir.join(APP_CONFIG_DIR).join(APP_CONFIG_FILE))
}

fn read_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.display().to_string(),
        source,
    })
}

fn find_dev_config() -> Option<PathBuf> {
    if let Ok(path_from_env) = std::env::var(DEV_CONFIG_ENV) {
        let from_env = PathBuf::from(path_from_env);
        if from_env.exists() {
            return Some(from_env);
        }
    }

    let cwd = std::env::current_dir().ok()?;
    let direct = cwd.join(DEV_CONFIG_FILE);
    if direct.exists() {
        return Some(direct);
    }

    let parent = cwd.parent()?.join(DEV_CONFIG_FILE);
    if parent.exists() {
        return Some(parent);
    }

    None
}

fn default_demo_group_name() -> String {
    DEFAULT_DEMO_GROUP_NAME.to_string()
}

fn default_signaling_url() -> String {
    DEFAULT_SIGNALING_URL.to_string()
}

/// The only transport every build registers; hosts that ship a hosted
/// provider select it in the config file.
const fn default_transport() -> TransportKind {
    TransportKind::Loopback
}

const fn default_noise_gate_threshold() -> f32 {
    -40.0
}

const fn default_local_sources_enabled() -> bool {
    true
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from(".")
}
