//! Execution configuration.
//!
//! [`ExecConfig`] holds the knobs an embedding application sets once per
//! plan: whether to run on a thread pool, how large that pool is, how table
//! sources slice their input and the default sink backpressure. It is read
//! from and written to TOML.
//!
//! # Example
//!
//! ```toml
//! use_threads = true
//! worker_threads = 4
//! table_source_batch_size = 65536
//!
//! [sink_backpressure]
//! resume_if_below = 268435456
//! pause_if_above = 1073741824
//! ```

use crate::error::{ExecError, Result};
use crate::plan::backpressure::BackpressureOptions;
use crate::plan::context::DEFAULT_TABLE_SOURCE_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-plan execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Dispatch node work onto a thread pool instead of the calling thread.
    #[serde(default)]
    pub use_threads: bool,

    /// Size of a dedicated pool. `None` shares the process-wide pool.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rows per batch emitted by table sources that do not set their own.
    #[serde(default = "default_table_source_batch_size")]
    pub table_source_batch_size: usize,

    /// Backpressure for generator sinks that do not set their own.
    #[serde(default)]
    pub sink_backpressure: Option<BackpressureOptions>,
}

fn default_table_source_batch_size() -> usize {
    DEFAULT_TABLE_SOURCE_BATCH_SIZE
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            use_threads: false,
            worker_threads: None,
            table_source_batch_size: DEFAULT_TABLE_SOURCE_BATCH_SIZE,
            sink_backpressure: None,
        }
    }
}

impl ExecConfig {
    /// Serial execution with defaults everywhere else.
    pub fn serial() -> Self {
        Self::default()
    }

    /// Execution on the shared thread pool.
    pub fn threaded() -> Self {
        Self {
            use_threads: true,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ExecConfig = toml::from_str(content)
            .map_err(|e| ExecError::Config(format!("Failed to parse exec config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ExecError::Config(format!("Failed to serialize exec config: {}", e)))
    }

    /// Load a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Config(format!("Failed to read exec config {:?}: {}", path, e))
        })?;
        tracing::debug!(path = ?path, "Loaded exec config");
        Self::from_toml_str(&content)
    }

    /// Load a config file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load exec config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ExecError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| {
            ExecError::Config(format!("Failed to write exec config {:?}: {}", path, e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(ExecError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.table_source_batch_size == 0 {
            return Err(ExecError::Config(
                "table_source_batch_size must be greater than 0".to_string(),
            ));
        }
        if let Some(backpressure) = &self.sink_backpressure {
            backpressure
                .validate()
                .map_err(|e| ExecError::Config(format!("Invalid sink_backpressure: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = ExecConfig::from_toml_str("").unwrap();
        assert_eq!(config, ExecConfig::default());
        assert_eq!(config.table_source_batch_size, 1 << 20);
    }

    #[test]
    fn test_parse_full_document() {
        let config = ExecConfig::from_toml_str(
            r#"
            use_threads = true
            worker_threads = 3
            table_source_batch_size = 128

            [sink_backpressure]
            resume_if_below = 10
            pause_if_above = 20
            "#,
        )
        .unwrap();
        assert!(config.use_threads);
        assert_eq!(config.worker_threads, Some(3));
        assert_eq!(config.table_source_batch_size, 128);
        assert_eq!(config.sink_backpressure, Some(BackpressureOptions::new(10, 20)));
    }

    #[test]
    fn test_toml_string_round_trip() {
        let config = ExecConfig {
            sink_backpressure: Some(BackpressureOptions::default()),
            ..ExecConfig::threaded()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(ExecConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_failures() {
        let zero_workers = ExecConfig {
            worker_threads: Some(0),
            ..ExecConfig::threaded()
        };
        assert_eq!(zero_workers.validate().unwrap_err().kind(), ErrorKind::Config);

        let zero_batch = ExecConfig {
            table_source_batch_size: 0,
            ..ExecConfig::default()
        };
        assert!(zero_batch.validate().is_err());

        let inverted = ExecConfig {
            sink_backpressure: Some(BackpressureOptions::new(20, 10)),
            ..ExecConfig::default()
        };
        let err = inverted.validate().unwrap_err();
        assert!(err.to_string().contains("resume_if_below"));
    }

    #[test]
    fn test_malformed_toml() {
        let err = ExecConfig::from_toml_str("use_threads = \"yes\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
