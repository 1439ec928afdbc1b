use crate::error::{OffsetError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an offset manager and the partition/broker managers it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetManagerConfig {
    /// Consumer group whose offsets are managed
    pub group: String,

    /// Capacity of each partition manager's error outbox
    pub channel_buffer_size: usize,

    /// Deliver errors on the partition's error stream instead of only logging them
    pub return_errors: bool,

    /// How often each broker offset manager flushes a batched commit
    pub commit_interval_ms: u64,

    /// Version of the OffsetFetch request used for the initial offset
    pub fetch_version: i16,

    /// Version of the OffsetCommit request used by flushes
    pub commit_version: i16,

    /// Coordinator resolution retry policy
    pub retry: RetryConfig,
}

/// Retry configuration for coordinator resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum consecutive failed resolutions before the partition manager gives up
    pub max_retries: usize,

    /// First retry delay
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay
    pub max_delay_ms: u64,

    /// Growth factor applied after each failed attempt
    pub multiplier: f64,

    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for OffsetManagerConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            channel_buffer_size: 256,
            return_errors: false,
            commit_interval_ms: 5_000, // 5 seconds
            fetch_version: 1,
            commit_version: 1,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl OffsetManagerConfig {
    pub fn for_group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OffsetManagerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(OffsetError::Configuration(
                "group cannot be empty".to_string(),
            ));
        }

        if self.channel_buffer_size == 0 {
            return Err(OffsetError::Configuration(
                "channel_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.commit_interval_ms == 0 {
            return Err(OffsetError::Configuration(
                "commit_interval_ms must be greater than 0".to_string(),
            ));
        }

        self.retry.validate()
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(OffsetError::Configuration(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(OffsetError::Configuration(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_values() {
        let config = OffsetManagerConfig::default();
        assert_eq!(config.channel_buffer_size, 256);
        assert_eq!(config.commit_interval(), Duration::from_secs(5));
        assert!(!config.return_errors);
        assert_eq!(config.fetch_version, 1);
        assert_eq!(config.retry.max_retries, 10);
    }

    #[test]
    fn test_default_config_requires_group() {
        let config = OffsetManagerConfig::default();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("group cannot be empty"));

        assert!(OffsetManagerConfig::for_group("billing").validate().is_ok());
    }

    #[test]
    fn test_config_validation_failures() {
        let mut config = OffsetManagerConfig::for_group("billing");
        config.channel_buffer_size = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("channel_buffer_size must be greater than 0"));

        let mut config = OffsetManagerConfig::for_group("billing");
        config.commit_interval_ms = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("commit_interval_ms must be greater than 0"));

        let mut config = OffsetManagerConfig::for_group("billing");
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = OffsetManagerConfig::for_group("billing");
        config.retry.base_delay_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = OffsetManagerConfig::from_toml_str(
            r#"
            group = "billing"
            return_errors = true
            commit_interval_ms = 250

            [retry]
            max_retries = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.group, "billing");
        assert!(config.return_errors);
        assert_eq!(config.commit_interval(), Duration::from_millis(250));
        assert_eq!(config.channel_buffer_size, 256);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 100);
    }

    #[test]
    fn test_toml_serialization_roundtrip() {
        let mut config = OffsetManagerConfig::for_group("billing");
        config.retry.jitter = false;

        let toml_string = toml::to_string(&config).unwrap();
        let deserialized = OffsetManagerConfig::from_toml_str(&toml_string).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "group = \"from-file\"\nchannel_buffer_size = 8").unwrap();

        let config = OffsetManagerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.group, "from-file");
        assert_eq!(config.channel_buffer_size, 8);

        let missing = OffsetManagerConfig::from_file("/nonexistent/offsets.toml");
        assert!(matches!(missing, Err(OffsetError::Io(_))));
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let result = OffsetManagerConfig::from_toml_str("group = [");
        assert!(matches!(result, Err(OffsetError::Configuration(_))));
    }
}
