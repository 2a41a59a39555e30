//! Runtime configuration.
//!
//! Defaults live here so every crate agrees on them. A TOML file can override
//! any value, and environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::LockKind;

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USER: &str = "MQTT_USER";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const MQTT_REPLY_TOPIC: &str = "MQTT_REPLY_TOPIC";
    pub const MQTT_COMMON_TOPIC: &str = "MQTT_COMMON_TOPIC";
    pub const SITE_HOST: &str = "SITE_HOST";
    pub const MEDIA_ROOT: &str = "MEDIA_ROOT";
    pub const DATA_DIR: &str = "BOARDHUB_DATA_DIR";
    pub const WORKERS: &str = "BOARDHUB_WORKERS";
    pub const LOG_DIR: &str = "LOG_DIR";
    pub const LOG_JSON: &str = "BOARDHUB_LOG_JSON";
}

/// Default values.
pub mod defaults {
    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const REPLY_TOPIC: &str = "boards/reply";
    pub const COMMON_TOPIC: &str = "boards";
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const PUBLISH_TIMEOUT_SECS: u64 = 10;

    pub const STATE_LOCK_TTL_SECS: u64 = 60;
    pub const STATE_TIMEOUT_SECS: u64 = 30;
    pub const FLASH_LOCK_TTL_SECS: u64 = 330;
    pub const FLASH_TIMEOUT_SECS: u64 = 300;

    pub const WORKERS: usize = 10;
    pub const GROUP: &str = "board_replies";
    pub const CONSUMER_PREFIX: &str = "worker";
    pub const POLL_INTERVAL_MS: u64 = 1000;
    pub const RECLAIM_INTERVAL_SECS: u64 = 15;
    pub const RECLAIM_IDLE_SECS: u64 = 60;
    pub const RECLAIM_BATCH: usize = 10;

    pub const SITE_HOST: &str = "http://localhost:8000";
    pub const DATA_DIR: &str = "./data";
    pub const MEDIA_ROOT: &str = "./media";
    pub const LOG_FILTER: &str = "boardhub=info";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub commands: CommandsConfig,
    pub reconciler: ReconcilerConfig,
    pub logging: LoggingConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id prefix; a random suffix is appended per connection.
    pub client_id: String,
    /// Topic devices publish their replies on.
    pub reply_topic: String,
    /// Commands go to `{common_topic}/{device_id}`, broadcasts to `{common_topic}`.
    pub common_topic: String,
    pub keep_alive_secs: u64,
    /// QoS for command publishes (0 or 1).
    pub publish_qos: u8,
    pub publish_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: defaults::MQTT_HOST.to_string(),
            port: defaults::MQTT_PORT,
            username: None,
            password: None,
            client_id: "boardhub".to_string(),
            reply_topic: defaults::REPLY_TOPIC.to_string(),
            common_topic: defaults::COMMON_TOPIC.to_string(),
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            publish_qos: 0,
            publish_timeout_secs: defaults::PUBLISH_TIMEOUT_SECS,
        }
    }
}

impl MqttConfig {
    /// Topic for commands addressed to one board.
    pub fn device_topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.common_topic.trim_end_matches('/'), device_id)
    }

    /// Topic for commands addressed to every board.
    pub fn broadcast_topic(&self) -> &str {
        self.common_topic.trim_end_matches('/')
    }

    /// Credentials, when both parts are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Root directory firmware file paths are relative to.
    pub media_root: PathBuf,
    /// Public base URL boards download firmware from.
    pub site_host: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            media_root: PathBuf::from(defaults::MEDIA_ROOT),
            site_host: defaults::SITE_HOST.to_string(),
        }
    }
}

impl StorageConfig {
    /// Path of the redb database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("boardhub.redb")
    }
}

/// Lock lifetime and watchdog delay for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTiming {
    pub lock_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl CommandTiming {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-kind command timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub state: CommandTiming,
    pub flash: CommandTiming,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            state: CommandTiming {
                lock_ttl_secs: defaults::STATE_LOCK_TTL_SECS,
                timeout_secs: defaults::STATE_TIMEOUT_SECS,
            },
            flash: CommandTiming {
                lock_ttl_secs: defaults::FLASH_LOCK_TTL_SECS,
                timeout_secs: defaults::FLASH_TIMEOUT_SECS,
            },
        }
    }
}

impl CommandsConfig {
    pub fn timing(&self, kind: LockKind) -> CommandTiming {
        match kind {
            LockKind::Pending => self.state,
            LockKind::Flashing => self.flash,
        }
    }
}

/// Reply worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub workers: usize,
    pub group: String,
    pub consumer_prefix: String,
    pub poll_interval_ms: u64,
    pub reclaim_interval_secs: u64,
    pub reclaim_idle_secs: u64,
    pub reclaim_batch: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKERS,
            group: defaults::GROUP.to_string(),
            consumer_prefix: defaults::CONSUMER_PREFIX.to_string(),
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            reclaim_interval_secs: defaults::RECLAIM_INTERVAL_SECS,
            reclaim_idle_secs: defaults::RECLAIM_IDLE_SECS,
            reclaim_batch: defaults::RECLAIM_BATCH,
        }
    }
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_secs(self.reclaim_idle_secs)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rolling log files; stderr only when unset.
    pub dir: Option<PathBuf>,
    pub json: bool,
    /// Filter used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            json: false,
            filter: defaults::LOG_FILTER.to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration: defaults, then the optional TOML file, then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: env_vars::MQTT_PORT,
                value: v,
            })?;
        }
        if let Some(v) = lookup(env_vars::MQTT_USER) {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_REPLY_TOPIC) {
            self.mqtt.reply_topic = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_COMMON_TOPIC) {
            self.mqtt.common_topic = v;
        }
        if let Some(v) = lookup(env_vars::SITE_HOST) {
            self.storage.site_host = v;
        }
        if let Some(v) = lookup(env_vars::MEDIA_ROOT) {
            self.storage.media_root = PathBuf::from(v);
        }
        if let Some(v) = lookup(env_vars::DATA_DIR) {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(env_vars::WORKERS) {
            self.reconciler.workers = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: env_vars::WORKERS,
                value: v,
            })?;
        }
        if let Some(v) = lookup(env_vars::LOG_DIR) {
            self.logging.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(env_vars::LOG_JSON) {
            self.logging.json = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: env_vars::LOG_JSON,
                value: v,
            })?;
        }
        Ok(())
    }

    /// Reject configurations that would break the locking protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in LockKind::ALL {
            let timing = self.commands.timing(kind);
            // The lock must outlive the watchdog, or it self-expires unobserved.
            if timing.lock_ttl_secs <= timing.timeout_secs {
                return Err(ConfigError::Invalid(format!(
                    "{} lock TTL ({}s) must exceed its timeout ({}s)",
                    kind, timing.lock_ttl_secs, timing.timeout_secs
                )));
            }
        }
        let reconciler = &self.reconciler;
        if reconciler.workers == 0 {
            return Err(ConfigError::Invalid("reconciler.workers must be > 0".into()));
        }
        if reconciler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("reconciler.poll_interval_ms must be > 0".into()));
        }
        if reconciler.reclaim_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.reclaim_interval_secs must be > 0".into(),
            ));
        }
        if reconciler.reclaim_batch == 0 {
            return Err(ConfigError::Invalid("reconciler.reclaim_batch must be > 0".into()));
        }
        if self.mqtt.publish_qos > 1 {
            return Err(ConfigError::Invalid("mqtt.publish_qos must be 0 or 1".into()));
        }
        if self.mqtt.reply_topic.is_empty() || self.mqtt.common_topic.is_empty() {
            return Err(ConfigError::Invalid("MQTT topics must not be empty".into()));
        }
        Ok(())
    }
}
