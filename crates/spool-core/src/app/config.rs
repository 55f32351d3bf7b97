//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! timer_poll_interval_ms = 500
//!
//! [step_retry]
//! base_delay_ms = 50
//! max_attempts = 3
//!
//! [invocation_retry]
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// In-place retries of a `run` producer that failed transiently.
    pub step_retry: RetryPolicy,

    /// Re-admission of an invocation after a transient error escaped its handler.
    pub invocation_retry: RetryPolicy,

    /// Retries of outbound calls, reusing the same token.
    pub call_retry: RetryPolicy,

    /// Longest the timer loop sleeps before looking at the clock again.
    pub timer_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryPolicy {
                base_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 5_000,
                max_attempts: Some(5),
            },
            invocation_retry: RetryPolicy {
                base_delay_ms: 500,
                multiplier: 2.0,
                max_delay_ms: 60_000,
                max_attempts: Some(10),
            },
            call_retry: RetryPolicy {
                base_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 5_000,
                max_attempts: Some(5),
            },
            timer_poll_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn timer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timer_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn sections_override_individual_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            timer_poll_interval_ms = 250

            [invocation_retry]
            base_delay_ms = 10
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.timer_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.invocation_retry.base_delay_ms, 10);
        assert_eq!(config.invocation_retry.max_attempts, Some(2));
        assert_eq!(config.invocation_retry.multiplier, 2.0);
        assert_eq!(config.step_retry, EngineConfig::default().step_retry);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.toml");
        std::fs::write(&path, "[call_retry]\nmax_attempts = 1\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.call_retry.max_attempts, Some(1));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("step_retry = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
