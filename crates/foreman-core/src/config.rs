//! Configuration - 実行時設定
//!
//! TOML ファイルから読み込みます。省略したキーはデフォルト値になります。
//!
//! ```toml
//! max_concurrent_executions = 4
//! max_scheduler_limit = 50
//! tick_interval = "5s"
//! log_filter = "foreman_core=debug,info"
//! store_path = "/var/lib/foreman/work.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower bound for `max_scheduler_limit`.
pub const MIN_SCHEDULER_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Executions allowed to run at the same time.
    pub max_concurrent_executions: usize,

    /// Max rows handed to the schedulers per scheduling pass (at least 20).
    pub max_scheduler_limit: usize,

    /// Period of the background tick loop. `None` disables it (drive `tick()` by hand).
    #[serde(with = "humantime_serde")]
    pub tick_interval: Option<Duration>,

    /// Fallback tracing filter when `RUST_LOG` is not set.
    pub log_filter: String,

    /// JSON snapshot of the store. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            max_scheduler_limit: MIN_SCHEDULER_LIMIT,
            tick_interval: Some(Duration::from_secs(1)),
            log_filter: "info".to_string(),
            store_path: None,
        }
    }
}

impl Configuration {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Configuration = toml::from_str(s)?;
        config.validated()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check hard errors and raise soft minimums.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        if self.tick_interval == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        if self.max_scheduler_limit < MIN_SCHEDULER_LIMIT {
            tracing::warn!(
                requested = self.max_scheduler_limit,
                min = MIN_SCHEDULER_LIMIT,
                "max_scheduler_limit too low, raised"
            );
            self.max_scheduler_limit = MIN_SCHEDULER_LIMIT;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Configuration::from_toml_str("").unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn parses_all_keys() {
        let config = Configuration::from_toml_str(
            r#"
            max_concurrent_executions = 8
            max_scheduler_limit = 64
            tick_interval = "250ms"
            log_filter = "debug"
            store_path = "/tmp/work.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_executions, 8);
        assert_eq!(config.max_scheduler_limit, 64);
        assert_eq!(config.tick_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/work.json")));
    }

    #[test]
    fn scheduler_limit_is_raised_to_minimum() {
        let config = Configuration::from_toml_str("max_scheduler_limit = 3").unwrap();
        assert_eq!(config.max_scheduler_limit, MIN_SCHEDULER_LIMIT);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Configuration::from_toml_str("max_concurrent_executions = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = Configuration::from_toml_str(r#"tick_interval = "soon""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_executions = 2").unwrap();

        let config = Configuration::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_executions, 2);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = Configuration::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
