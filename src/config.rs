//! Staging pool configuration and constants.
//!
//! This module centralizes all configuration values, whether loaded from files and
//! environment variables or defined as constants. Runtime configuration follows a
//! defaults-then-merge-then-validate pattern so embedding applications can override
//! any knob through TOML, YAML or the environment.

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TransferError};

/// Serde helper for Duration serialization/deserialization as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Staging pool constants
pub mod staging {
    use std::time::Duration;

    /// Default capacity of one staging buffer in bytes
    pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024 * 1024; // 4MB

    /// Number of buffers allocated at pool initialization
    pub const DEFAULT_INITIAL_BUFFERS: usize = 4;

    /// Hard limit on pool growth
    pub const DEFAULT_MAX_BUFFERS: usize = 16;

    /// Default bound on a blocking acquire
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Page size used for staging buffer alignment
    pub const PAGE_SIZE: usize = 4096;
}

/// What `acquire` does when the pool is at its growth limit with no free buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Wait (bounded by `acquire_timeout`) for an in-flight transfer to release.
    Block,
    /// Fail immediately with `PoolExhausted`.
    Fail,
}

fn default_buffer_capacity() -> usize {
    staging::DEFAULT_BUFFER_CAPACITY
}
fn default_initial_buffers() -> usize {
    staging::DEFAULT_INITIAL_BUFFERS
}
fn default_max_buffers() -> usize {
    staging::DEFAULT_MAX_BUFFERS
}
fn default_acquire_timeout() -> Duration {
    staging::DEFAULT_ACQUIRE_TIMEOUT
}
fn default_exhaustion() -> ExhaustionPolicy {
    ExhaustionPolicy::Block
}

/// Staging pool configuration loaded from multiple sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Capacity of one staging buffer in bytes; requests larger than this get
    /// a dedicated larger buffer on growth
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Number of buffers allocated up front
    #[serde(default = "default_initial_buffers")]
    pub initial_buffers: usize,

    /// Maximum number of buffers the pool may grow to
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,

    /// Bound on a blocking acquire, in milliseconds
    #[serde(with = "duration_ms", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,

    /// Behavior when the pool is full and at its growth limit
    #[serde(default = "default_exhaustion")]
    pub exhaustion: ExhaustionPolicy,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            initial_buffers: default_initial_buffers(),
            max_buffers: default_max_buffers(),
            acquire_timeout: default_acquire_timeout(),
            exhaustion: default_exhaustion(),
        }
    }
}

impl StagingConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. gpu-staging.yaml (if exists)
    /// 3. gpu-staging.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        let config: StagingConfig = Figment::new()
            .merge(Serialized::defaults(StagingConfig::default()))
            .merge(Toml::file("gpu-staging.toml"))
            .merge(Yaml::file("gpu-staging.yaml"))
            .merge(Env::prefixed("GPU_STAGING_"))
            .extract()
            .map_err(|e| TransferError::Config(format!("failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(TransferError::Config(
                "buffer_capacity must be non-zero".to_string(),
            ));
        }
        if self.max_buffers == 0 {
            return Err(TransferError::Config(
                "max_buffers must be non-zero".to_string(),
            ));
        }
        if self.initial_buffers > self.max_buffers {
            return Err(TransferError::Config(format!(
                "initial_buffers ({}) exceeds max_buffers ({})",
                self.initial_buffers, self.max_buffers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = StagingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity, 4 * 1024 * 1024);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Block);
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = StagingConfig {
            buffer_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn rejects_initial_above_max() {
        let config = StagingConfig {
            initial_buffers: 8,
            max_buffers: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn merges_toml_overrides() {
        let toml = r#"
            buffer_capacity = 65536
            max_buffers = 2
            initial_buffers = 1
            acquire_timeout = 250
            exhaustion = "fail"
        "#;
        let config: StagingConfig = Figment::new()
            .merge(Serialized::defaults(StagingConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(config.buffer_capacity, 65536);
        assert_eq!(config.max_buffers, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.exhaustion, ExhaustionPolicy::Fail);
    }

    #[test]
    fn toml_round_trip() {
        let config = StagingConfig::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: StagingConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.buffer_capacity, config.buffer_capacity);
        assert_eq!(decoded.acquire_timeout, config.acquire_timeout);
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_capacity: 8192").unwrap();
        writeln!(file, "initial_buffers: 2").unwrap();

        let config: StagingConfig = Figment::new()
            .merge(Serialized::defaults(StagingConfig::default()))
            .merge(Yaml::file(file.path()))
            .extract()
            .unwrap();
        assert_eq!(config.buffer_capacity, 8192);
        assert_eq!(config.initial_buffers, 2);
        // untouched knobs keep their defaults
        assert_eq!(config.max_buffers, staging::DEFAULT_MAX_BUFFERS);
    }

    #[test]
    fn yaml_round_trip() {
        let config = StagingConfig {
            exhaustion: ExhaustionPolicy::Fail,
            ..Default::default()
        };
        let encoded = serde_yaml::to_string(&config).unwrap();
        let decoded: StagingConfig = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(decoded.exhaustion, ExhaustionPolicy::Fail);
    }
}
