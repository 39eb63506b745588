use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::memory::DEFAULT_GROUP;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub poller: PollerConfig,
    pub memory: MemoryConfig,
    pub redis: RedisStreamConfig,
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

/// Background poller settings shared by typed stream facades
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Sleep between polls when a stream has nothing to deliver
    pub poll_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub default_group: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_group: DEFAULT_GROUP.to_string(),
        }
    }
}

/// Redis Streams backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStreamConfig {
    pub url: String,
    /// Prefix prepended to every stream id to form the Redis key
    pub key_prefix: String,
    pub consumer_group: String,
    /// Prefix of this process's consumer name; a random suffix is appended
    pub consumer_prefix: String,
    /// Idle time after which a pending entry may be reclaimed by any consumer
    pub claim_timeout_ms: u64,
    /// Handlers slower than this are logged; has no effect on delivery
    pub consumer_warn_timeout_ms: u64,
    /// Bound applied to every Redis command
    pub operation_timeout_ms: u64,
    /// Approximate MAXLEN applied on XADD; `None` keeps every entry
    pub max_stream_length: Option<usize>,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "groupstream:".to_string(),
            consumer_group: DEFAULT_GROUP.to_string(),
            consumer_prefix: "consumer".to_string(),
            claim_timeout_ms: 30_000,
            consumer_warn_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            max_stream_length: None,
        }
    }
}

impl RedisStreamConfig {
    #[must_use]
    pub fn default_consumer_group_name(&self) -> &str {
        &self.consumer_group
    }

    #[must_use]
    pub const fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    #[must_use]
    pub const fn consumer_warn_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_warn_timeout_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (GROUPSTREAM_REDIS__URL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("GROUPSTREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check values that would otherwise fail later at runtime
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.poller.poll_interval_ms == 0 {
            errors.push("poller.poll_interval_ms must be greater than 0".to_string());
        }
        if self.memory.default_group.trim().is_empty() {
            errors.push("memory.default_group must not be empty".to_string());
        }
        if self.redis.consumer_group.trim().is_empty() {
            errors.push("redis.consumer_group must not be empty".to_string());
        }
        if self.redis.claim_timeout_ms == 0 {
            errors.push("redis.claim_timeout_ms must be greater than 0".to_string());
        }
        if self.redis.consumer_warn_timeout_ms > self.redis.claim_timeout_ms {
            errors.push(
                "redis.consumer_warn_timeout_ms must not exceed redis.claim_timeout_ms".to_string(),
            );
        }
        if self.redis.operation_timeout_ms == 0 {
            errors.push("redis.operation_timeout_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
