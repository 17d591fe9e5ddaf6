//! Engine configuration: timeouts, backoff schedules and polling cadence.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;
use crate::poll::{PollSpec, ResourceStatus};
use crate::tags::RESERVED_TAG_PREFIXES;

/// Per-kind operation timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub create_secs: u64,
    pub update_secs: u64,
    pub delete_secs: u64,
    pub read_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_secs: 600,
            update_secs: 600,
            delete_secs: 1200,
            read_secs: 300,
        }
    }
}

/// Serialized form of a [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub increment_ms: u64,
    #[serde(default)]
    pub cap_ms: Option<u64>,
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(c: BackoffConfig) -> Self {
        let policy = BackoffPolicy::new(
            Duration::from_millis(c.initial_ms),
            Duration::from_millis(c.increment_ms),
        );
        match c.cap_ms {
            Some(cap) => policy.with_cap(Duration::from_millis(cap)),
            None => policy,
        }
    }
}

impl From<BackoffPolicy> for BackoffConfig {
    fn from(p: BackoffPolicy) -> Self {
        Self {
            initial_ms: p.initial().as_millis() as u64,
            increment_ms: p.increment().as_millis() as u64,
            cap_ms: p.cap().map(|c| c.as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    pub timeouts: Timeouts,
    pub read_backoff: BackoffConfig,
    pub mutate_backoff: BackoffConfig,
    pub tag_backoff: BackoffConfig,
    /// Time between two status probes.
    pub poll_interval_ms: u64,
    /// Wait before the first probe after a mutating call.
    pub poll_delay_ms: u64,
    pub page_size: u32,
    pub reserved_tag_prefixes: Vec<String>,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            read_backoff: BackoffPolicy::read().into(),
            mutate_backoff: BackoffPolicy::mutate().into(),
            tag_backoff: BackoffPolicy::tagging().into(),
            poll_interval_ms: 5000,
            poll_delay_ms: 5000,
            page_size: 50,
            reserved_tag_prefixes: RESERVED_TAG_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ConvergeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.create_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.update_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.delete_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.read_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn read_backoff(&self) -> BackoffPolicy {
        self.read_backoff.into()
    }

    pub fn mutate_backoff(&self) -> BackoffPolicy {
        self.mutate_backoff.into()
    }

    pub fn tag_backoff(&self) -> BackoffPolicy {
        self.tag_backoff.into()
    }

    /// Poll spec waiting for one of `target` with this config's interval and delay.
    pub fn poll_spec<S: ResourceStatus>(
        &self,
        target: impl IntoIterator<Item = S>,
        failure: impl IntoIterator<Item = S>,
        timeout: Duration,
    ) -> Result<PollSpec<S>, ConfigError> {
        Ok(PollSpec::new(target, failure, self.poll_interval(), timeout)?
            .with_delay(self.poll_delay()))
    }

    /// Poll spec waiting for the resource to disappear.
    pub fn absence_spec<S: ResourceStatus>(
        &self,
        timeout: Duration,
    ) -> Result<PollSpec<S>, ConfigError> {
        Ok(PollSpec::absent(self.poll_interval(), timeout)?.with_delay(self.poll_delay()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_is_default() {
        let config = ConvergeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ConvergeConfig::default());
        assert_eq!(config.read_backoff(), BackoffPolicy::read());
        assert_eq!(config.delete_timeout(), Duration::from_secs(1200));
        assert_eq!(config.reserved_tag_prefixes.len(), 4);
    }

    #[test]
    fn test_partial_override() {
        let config = ConvergeConfig::from_json_str(
            r#"{
                "timeouts": { "create_secs": 30 },
                "tag_backoff": { "initial_ms": 100, "increment_ms": 50 },
                "page_size": 10
            }"#,
        )
        .unwrap();

        assert_eq!(config.create_timeout(), Duration::from_secs(30));
        assert_eq!(config.update_timeout(), Duration::from_secs(600));
        assert_eq!(config.page_size, 10);
        let tags = config.tag_backoff();
        assert_eq!(tags.next(2), Duration::from_millis(200));
        assert_eq!(tags.cap(), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ConvergeConfig::from_json_str(r#"{ "page_size": 0 }"#),
            Err(ConfigError::ZeroPageSize)
        ));
        assert!(matches!(
            ConvergeConfig::from_json_str(r#"{ "poll_interval_ms": 0 }"#),
            Err(ConfigError::ZeroPollInterval)
        ));
        assert!(matches!(
            ConvergeConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "poll_interval_ms": 250, "poll_delay_ms": 0 }}"#).unwrap();

        let config = ConvergeConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.poll_delay(), Duration::ZERO);

        let missing = ConvergeConfig::load("/nonexistent/converge.json");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
