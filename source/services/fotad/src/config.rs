// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! One TOML file, read once at startup. Anything the update cycle or the
//! boot success monitor can tune lives here; slot geometry is
//! configuration, never persistent state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default config location on the device.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fotad/fotad.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config invalid: {0}")]
    Invalid(String),
}

/// One slot's storage geometry and boot arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    pub boot_device: PathBuf,
    pub root_device: PathBuf,
    /// Kernel command line for falcon boot of this slot.
    pub cmdline: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Base URL of the update server.
    pub server_url: String,
    /// Unique device identifier reported to the server.
    pub device_id: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stabilize")]
    pub stabilize_secs: u64,
    #[serde(default = "default_retries")]
    pub download_retries: u32,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Persistent data partition root; created once at startup.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Hex-encoded ed25519 publisher key; manifest signatures are
    /// enforced when present.
    #[serde(default)]
    pub publisher_key: Option<String>,

    /// Kernel image file name inside each slot's boot area.
    #[serde(default = "default_kernel_image")]
    pub kernel_image: String,

    pub slot_a: SlotConfig,
    pub slot_b: SlotConfig,
}

fn default_poll_interval() -> u64 {
    3600
}

fn default_stabilize() -> u64 {
    60
}

fn default_retries() -> u32 {
    2
}

fn default_check_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/fotad")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/data/fotad/bootstate.bin")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/data/fotad/scratch")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/fotad.sock")
}

fn default_kernel_image() -> String {
    "zImage".into()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.server_url.starts_with("http://") {
            return Err(ConfigError::Invalid(format!(
                "server_url must be http://..., got {}",
                self.server_url
            )));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        self.publisher_key_bytes()?;
        Ok(())
    }

    /// Decodes the configured publisher key, if any.
    pub fn publisher_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(text) = &self.publisher_key else {
            return Ok(None);
        };
        let raw = hex::decode(text)
            .map_err(|_| ConfigError::Invalid("publisher_key is not hex".into()))?;
        let key: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::Invalid("publisher_key must be 32 bytes".into()))?;
        Ok(Some(key))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stabilize_delay(&self) -> Duration {
        Duration::from_secs(self.stabilize_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
