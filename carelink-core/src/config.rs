use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub realtime: RealtimeConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Postgres connection used for read-receipt persistence.
/// An empty `url` selects the in-memory receipt store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 10,
        }
    }
}

/// Redis pub/sub transport. An empty `url` selects the in-process transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub operation_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "carelink:".to_string(),
            operation_timeout_seconds: 5,
        }
    }
}

/// Tuning for the realtime synchronization layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Consecutive failed reconnects before automatic retries stop
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Interval of the silent-failure check
    pub heartbeat_interval_secs: u64,
    /// Debounce window for table watches that do not set their own
    pub default_debounce_ms: u64,
    /// Age after which a typing indicator counts as stopped
    pub typing_timeout_secs: u64,
    /// Inbound events queued per live channel before new ones are dropped.
    /// Also sizes the supervisor command queue.
    pub event_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            heartbeat_interval_secs: 30,
            default_debounce_ms: 100,
            typing_timeout_secs: 10,
            event_buffer: 256,
        }
    }
}

/// Who this process acts as
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_id: String,
    pub tenant_id: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            tenant_id: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CARELINK_REALTIME__MAX_BACKOFF_MS, CARELINK_REDIS__URL, etc.
        builder = builder.add_source(
            Environment::with_prefix("CARELINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for settings that would make the realtime layer misbehave.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let rt = &self.realtime;

        if rt.max_reconnect_attempts == 0 {
            errors.push("realtime.max_reconnect_attempts must be at least 1".to_string());
        }
        if rt.initial_backoff_ms == 0 {
            errors.push("realtime.initial_backoff_ms must be positive".to_string());
        }
        if rt.initial_backoff_ms > rt.max_backoff_ms {
            errors.push(format!(
                "realtime.initial_backoff_ms ({}) exceeds realtime.max_backoff_ms ({})",
                rt.initial_backoff_ms, rt.max_backoff_ms
            ));
        }
        if rt.heartbeat_interval_secs == 0 {
            errors.push("realtime.heartbeat_interval_secs must be positive".to_string());
        }
        if rt.typing_timeout_secs == 0 {
            errors.push("realtime.typing_timeout_secs must be positive".to_string());
        }
        if rt.event_buffer == 0 {
            errors.push("realtime.event_buffer must be positive".to_string());
        }
        if self.identity.user_id.trim().is_empty() {
            errors.push("identity.user_id must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn uses_redis(&self) -> bool {
        !self.redis.url.is_empty()
    }

    #[must_use]
    pub fn uses_database(&self) -> bool {
        !self.database.url.is_empty()
    }
}
