//! Sync engine configuration.
//!
//! Loaded from RON. Every field has a default, so `()` alone is a
//! valid config. A fuller example:
//!
//! ```ron
//! (
//!     debounce_window_ms: 1500,
//!     call_timeout_ms: 10000,
//!     normalize_elements: false,
//!     journal_path: Some("queue.db"),
//!     queue: (max_attempts: 5, base_backoff_ms: 500),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;

/// Errors loading or validating a config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON serialize error: {0}")]
    Serialize(#[from] ron::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_window_ms: u64,
    pub call_timeout_ms: u64,
    pub transient_retries: u32,
    pub transient_retry_delay_ms: u64,
    /// Also write canvas elements as rows of their own collection.
    pub normalize_elements: bool,
    /// SQLite file mirroring the retry queue. `None` keeps it in memory only.
    pub journal_path: Option<PathBuf>,
    pub queue: QueueConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW.as_millis() as u64,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
            transient_retry_delay_ms: DEFAULT_TRANSIENT_RETRY_DELAY.as_millis() as u64,
            normalize_elements: false,
            journal_path: None,
            queue: QueueConfig::default(),
        }
    }
}

/// Retry queue tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl QueueConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl SyncConfig {
    /// Read and validate a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }

    /// Parse and validate RON text.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call_timeout_ms must be positive".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.base_backoff_ms > self.queue.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "queue.base_backoff_ms ({}) exceeds queue.max_backoff_ms ({})",
                self.queue.base_backoff_ms, self.queue.max_backoff_ms
            )));
        }
        if !(0.0..1.0).contains(&self.queue.jitter) {
            return Err(ConfigError::Invalid(format!(
                "queue.jitter must be in [0, 1), got {}",
                self.queue.jitter
            )));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_defaults() {
        let config = SyncConfig::from_ron_str("()").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.debounce_window(), Duration::from_millis(1500));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.max_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_override() {
        let config = SyncConfig::from_ron_str(
            r#"(
                debounce_window_ms: 300,
                normalize_elements: true,
                journal_path: Some("queue.db"),
                queue: (max_attempts: 5),
            )"#,
        )
        .unwrap();
        assert_eq!(config.debounce_window_ms, 300);
        assert!(config.normalize_elements);
        assert_eq!(config.journal_path, Some(PathBuf::from("queue.db")));
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.base_backoff_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_queue() {
        let err = SyncConfig::from_ron_str("(queue: (max_attempts: 0))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = SyncConfig::from_ron_str("(queue: (base_backoff_ms: 60000, max_backoff_ms: 1000))")
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_validate_rejects_non_finite_jitter() {
        let mut config = SyncConfig::default();
        config.queue.jitter = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.queue.jitter = f64::INFINITY;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error_surfaces() {
        let err = SyncConfig::from_ron_str("(debounce_window_ms: \"soon\")").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_from_file_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.ron");
        let mut original = SyncConfig::default();
        original.transient_retries = 2;
        std::fs::write(&path, original.to_ron_string().unwrap()).unwrap();

        assert_eq!(SyncConfig::load(&path).unwrap(), original);
        assert!(matches!(
            SyncConfig::load(dir.path().join("missing.ron")),
            Err(ConfigError::Io { .. })
        ));
    }
}
