//! Witness Configuration Module
//! Handles loading and validating witness.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "witness.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub log: LogConfig,
    pub update: UpdateConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the slot files, relative to the device directory
    pub path: PathBuf,
    #[serde(default = "default_num_slots")]
    pub num_slots: u32,
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub url: String,
    pub origin: String,
    /// Note verifier key of the log, `name+hash+key`
    pub verifier_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub install_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_num_slots() -> u32 {
    64
}

fn default_slot_size() -> usize {
    4096
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    300
}

fn default_port() -> u16 {
    8420
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(device_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = device_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, device_dir: &Path) -> Result<(), ConfigError> {
        let config_path = device_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.num_slots < 2 {
            return Err(ConfigError::Invalid(
                "storage.num_slots must leave room for the directory and one log".to_string(),
            ));
        }
        if self.storage.slot_size == 0 {
            return Err(ConfigError::Invalid("storage.slot_size must be positive".to_string()));
        }
        if self.update.interval_secs == 0 {
            return Err(ConfigError::Invalid("update.interval_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn default_for_device(log_url: &str, origin: &str, verifier_key: &str) -> Self {
        Self {
            storage: StorageConfig {
                path: PathBuf::from("./slots"),
                num_slots: default_num_slots(),
                slot_size: default_slot_size(),
            },
            log: LogConfig {
                url: log_url.to_string(),
                origin: origin.to_string(),
                verifier_key: verifier_key.to_string(),
                timeout_secs: default_timeout_secs(),
            },
            update: UpdateConfig {
                interval_secs: default_interval_secs(),
                install_dir: PathBuf::from("./firmware"),
            },
            api: ApiConfig::default(),
            log_level: default_log_level(),
        }
    }

    pub fn storage_dir(&self, device_dir: &Path) -> PathBuf {
        device_dir.join(&self.storage.path)
    }

    pub fn install_dir(&self, device_dir: &Path) -> PathBuf {
        device_dir.join(&self.update.install_dir)
    }

    pub fn state_path(&self, device_dir: &Path) -> PathBuf {
        self.install_dir(device_dir).join("update-state.json")
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update.interval_secs)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log.timeout_secs)
    }
}
