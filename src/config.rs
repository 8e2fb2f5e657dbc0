use std::env;
use std::path::PathBuf;

use async_trait::async_trait;
use channel_messenger::{MessengerBuilder, TaskQueueOptions};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::logger::LogLevel;

pub const KEY_LOG_LEVEL: &str = "BINMUX_LOG_LEVEL";
pub const KEY_LOG_DIR: &str = "BINMUX_LOG_DIR";
pub const KEY_BUFFER_INCOMING: &str = "BINMUX_BUFFER_INCOMING";
pub const KEY_PLATFORM_THREAD_NAME: &str = "BINMUX_PLATFORM_THREAD_NAME";
pub const KEY_BACKGROUND_QUEUE_SERIAL: &str = "BINMUX_BACKGROUND_QUEUE_SERIAL";

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn keys(&self) -> Vec<String>;

    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
}

/// Process environment, optionally seeded from a `.env` file. Variables already
/// set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigSource {
    env_file: Option<PathBuf>,
}

impl EnvConfigSource {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        if let Some(path) = &env_file {
            match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => warn!("could not load .env from {}: {err}", path.display()),
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&PathBuf> {
        self.env_file.as_ref()
    }
}

#[async_trait]
impl ConfigSource for EnvConfigSource {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }
}

/// In-memory settings, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    map: DashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

#[async_trait]
impl ConfigSource for MapConfigSource {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runtime settings for a messenger and its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MessengerSettings {
    /// Default verbosity; `RUST_LOG` still takes precedence.
    pub log_level: LogLevel,
    /// Directory for daily rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Hold messages for channels without a handler until one is registered.
    pub buffer_incoming: bool,
    /// Name of the dedicated platform thread.
    pub platform_thread_name: String,
    /// Whether background queues run their tasks one at a time.
    pub background_queue_serial: bool,
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            buffer_incoming: false,
            platform_thread_name: "platform".to_string(),
            background_queue_serial: true,
        }
    }
}

impl MessengerSettings {
    /// Read the `BINMUX_*` keys from `source`, falling back to defaults.
    pub async fn load(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(value) = source.get(KEY_LOG_LEVEL).await {
            settings.log_level = value
                .parse()
                .map_err(|e: crate::logger::ParseLogLevelError| {
                    ConfigError::invalid(KEY_LOG_LEVEL, &value, e.to_string())
                })?;
        }
        if let Some(value) = source.get(KEY_LOG_DIR).await {
            let trimmed = value.trim();
            settings.log_dir = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
        }
        if let Some(value) = source.get(KEY_BUFFER_INCOMING).await {
            settings.buffer_incoming = parse_bool(KEY_BUFFER_INCOMING, &value)?;
        }
        if let Some(value) = source.get(KEY_PLATFORM_THREAD_NAME).await {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(ConfigError::invalid(
                    KEY_PLATFORM_THREAD_NAME,
                    &value,
                    "thread name must not be empty",
                ));
            }
            settings.platform_thread_name = trimmed.to_string();
        }
        if let Some(value) = source.get(KEY_BACKGROUND_QUEUE_SERIAL).await {
            settings.background_queue_serial = parse_bool(KEY_BACKGROUND_QUEUE_SERIAL, &value)?;
        }

        Ok(settings)
    }

    pub fn queue_options(&self) -> TaskQueueOptions {
        TaskQueueOptions::new().serial(self.background_queue_serial)
    }

    pub fn apply(&self, builder: MessengerBuilder) -> MessengerBuilder {
        builder
            .buffer_incoming(self.buffer_incoming)
            .platform_thread_name(self.platform_thread_name.clone())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

/// Pretty-printed JSON schema of [`MessengerSettings`].
pub fn settings_schema() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&schemars::schema_for!(MessengerSettings))
}
