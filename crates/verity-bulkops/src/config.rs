//! Bulk operation manager configuration.
//!
//! Loaded from the `[bulk]` table of a TOML file or built in code. Every field
//! has a default so partial files are accepted.

use crate::error::{BulkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Deployment mode of the controller; selects the active kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Datacenter,
    Campus,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Datacenter => f.write_str("datacenter"),
            Mode::Campus => f.write_str("campus"),
        }
    }
}

impl FromStr for Mode {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "datacenter" => Ok(Mode::Datacenter),
            "campus" => Ok(Mode::Campus),
            other => Err(BulkError::config(format!("unknown mode {other}"))),
        }
    }
}

/// Tunables for batching, caching, retries and shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Flush a kind once its queue holds this many intents; also the
    /// per-request chunk size for upserts
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush a kind once its oldest intent is this old
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,

    /// How long a successful write is trusted in place of a read
    #[serde(default = "default_recent_ops_ttl_ms")]
    pub recent_ops_ttl_ms: u64,

    /// Maximum age of a cached `Get(kind)` snapshot
    #[serde(default = "default_snapshot_ttl_ms")]
    pub snapshot_ttl_ms: u64,

    /// Retries on retryable transport errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff, doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on a single backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Grace period for in-flight batches on close
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,

    /// Names per bulk delete request
    #[serde(default = "default_max_delete_batch_size")]
    pub max_delete_batch_size: usize,

    /// Dispatcher timer resolution for the age trigger
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Timeout of a single transport call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub mode: Mode,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_batch_age_ms() -> u64 {
    2000
}

fn default_recent_ops_ttl_ms() -> u64 {
    30_000
}

fn default_snapshot_ttl_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_shutdown_deadline_ms() -> u64 {
    30_000
}

fn default_max_delete_batch_size() -> usize {
    100
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
            recent_ops_ttl_ms: default_recent_ops_ttl_ms(),
            snapshot_ttl_ms: default_snapshot_ttl_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            max_delete_batch_size: default_max_delete_batch_size(),
            tick_interval_ms: default_tick_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            mode: Mode::default(),
        }
    }
}

impl BulkConfig {
    /// Parses a TOML document holding the fields at top level.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| BulkError::config(format!("Failed to parse bulk config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BulkError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(BulkError::config("max_batch_size must be > 0"));
        }
        if self.max_delete_batch_size == 0 {
            return Err(BulkError::config("max_delete_batch_size must be > 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(BulkError::config("tick_interval_ms must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(BulkError::config("request_timeout_ms must be > 0"));
        }
        if self.retry_backoff_ms > self.max_backoff_ms {
            return Err(BulkError::config(
                "retry_backoff_ms must not exceed max_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    pub fn recent_ops_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_ops_ttl_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BulkConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_batch_age(), Duration::from_secs(2));
        assert_eq!(config.recent_ops_ttl(), Duration::from_secs(30));
        assert_eq!(config.snapshot_ttl(), Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(500));
        assert_eq!(config.shutdown_deadline(), Duration::from_secs(30));
        assert_eq!(config.mode, Mode::Datacenter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BulkConfig::from_toml_str(
            r#"
max_batch_size = 25
mode = "campus"
"#,
        )
        .unwrap();
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.mode, Mode::Campus);
        assert_eq!(config.max_delete_batch_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = BulkConfig::default();
        config.max_batch_size = 0;
        assert!(config.validate().is_err());
        assert!(BulkConfig::from_toml_str("max_batch_size = 0").is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut config = BulkConfig::default();
        config.retry_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            BulkConfig::from_toml_str("max_batch_size = \"many\""),
            Err(BulkError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "recent_ops_ttl_ms = 5000").unwrap();
        let config = BulkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.recent_ops_ttl(), Duration::from_secs(5));

        assert!(BulkConfig::from_file("/nonexistent/bulk.toml").is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Campus".parse::<Mode>().unwrap(), Mode::Campus);
        assert_eq!(Mode::Datacenter.to_string(), "datacenter");
        assert!("edge".parse::<Mode>().is_err());
    }
}
