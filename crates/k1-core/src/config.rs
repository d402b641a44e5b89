//! Configuration for the K1 tools.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $K1_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/k1/config.toml
//!   3. ~/.config/k1/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::eval::{EngineConfig, MapError, PixelMap};
use crate::frame::{cap_percent_to_byte, CHANNEL_LEN, PIXEL_COUNT};
use crate::wire::{MAX_SEQUENCE_FRAMES, PUT_DATA_MAX};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct K1Config {
    pub device: DeviceConfig,
    pub engine: EngineSettings,
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Brightness cap as a percentage of full scale.
    pub cap_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub pixel_count: usize,
    pub channel_len: usize,
    /// Logical → physical LED table. Absent = identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<Vec<usize>>,
}

/// Session timings. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ack_timeout_ms: u64,
    pub max_attempts: u32,
    /// Pause before retry `n` is `n * retry_pause_step_ms`.
    pub retry_pause_step_ms: u64,
    pub keepalive_ms: u64,
    pub status_refresh_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub jitter_cap_ms: u64,
    pub inventory_timeout_ms: u64,
    pub max_sequence_frames: usize,
    /// Chunk size used until the device advertises its own.
    pub chunk_max: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            url: "ws://192.168.4.1/ws".to_string(),
            cap_percent: 100.0,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pixel_count: PIXEL_COUNT,
            channel_len: CHANNEL_LEN,
            map: None,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 3_000,
            max_attempts: 3,
            retry_pause_step_ms: 300,
            keepalive_ms: 30_000,
            status_refresh_ms: 15_000,
            backoff_floor_ms: 500,
            backoff_ceiling_ms: 15_000,
            jitter_cap_ms: 1_000,
            inventory_timeout_ms: 1_500,
            max_sequence_frames: MAX_SEQUENCE_FRAMES,
            chunk_max: PUT_DATA_MAX,
        }
    }
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_millis(self.status_refresh_ms)
    }

    pub fn inventory_timeout(&self) -> Duration {
        Duration::from_millis(self.inventory_timeout_ms)
    }

    /// Pause before the attempt following `attempt` (1-based).
    pub fn retry_pause(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_pause_step_ms * u64::from(attempt))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("k1")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid [engine] map: {0}")]
    InvalidMap(#[from] MapError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl K1Config {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            K1Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        tracing::debug!(path = %path.display(), url = %config.device.url, "config loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("K1_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&K1Config::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply K1_* overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("K1_DEVICE__URL") {
            self.device.url = v;
        }
        if let Some(v) = lookup("K1_DEVICE__CAP_PERCENT") {
            if let Ok(p) = v.parse() {
                self.device.cap_percent = p;
            }
        }
        if let Some(v) = lookup("K1_ENGINE__PIXEL_COUNT") {
            if let Ok(n) = v.parse() {
                self.engine.pixel_count = n;
            }
        }
        if let Some(v) = lookup("K1_LINK__ACK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.link.ack_timeout_ms = ms;
            }
        }
    }

    /// Cap byte for the post-processor.
    pub fn cap_byte(&self) -> u8 {
        cap_percent_to_byte(self.device.cap_percent)
    }

    /// Evaluator settings, with the map validated against the pixel count.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let base = EngineConfig::new(self.engine.pixel_count, self.engine.channel_len);
        match &self.engine.map {
            Some(table) => Ok(base.with_map(PixelMap::from_table(table.clone())?)?),
            None => Ok(base),
        }
    }
}
