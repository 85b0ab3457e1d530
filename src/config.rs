//! Service configuration.
//!
//! Configuration is read from a TOML file with three sections, each fully
//! defaulted so an empty file (or no file) is valid:
//!
//! ```toml
//! [execution]
//! batch_execution_count = 1
//! include_actual_plan = false
//! include_estimated_plan = false
//! row_count_limit = 0          # 0 = unbounded
//! update_interval_rows = 1000
//!
//! [storage]
//! kind = "file"                # or "memory"
//! directory = "/var/tmp/querydeck"
//!
//! [logging]
//! level = "info"
//! format = "compact"           # or "json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`ServiceConfig`].
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    /// A setting has an unsupported value.
    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Global execution defaults.
    pub execution: ExecutionSettings,
    /// Row buffer storage backend.
    pub storage: StorageConfig,
    /// Logging output.
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.update_interval_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "execution.update_interval_rows",
                message: "must be at least 1".to_string(),
            });
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid {
                key: "logging.level",
                message: format!(
                    "'{}' is not one of: {}",
                    self.logging.level,
                    VALID_LEVELS.join(", ")
                ),
            });
        }

        if let Some(directory) = &self.storage.directory
            && self.storage.kind == StorageKind::File
            && !directory.is_dir()
        {
            return Err(ConfigError::Invalid {
                key: "storage.directory",
                message: format!("{} is not a directory", directory.display()),
            });
        }

        Ok(())
    }
}

/// Options controlling how a query executes.
///
/// A global instance comes from `[execution]`; editors may register a
/// per-owner override and individual requests may ask for plans. See
/// [`merged_with`](Self::merged_with) for how these combine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Number of times each batch runs. Values <= 0 mean 1.
    pub batch_execution_count: i32,
    /// Capture the plan the engine actually used.
    pub include_actual_plan: bool,
    /// Capture the estimated plan instead of running the statements.
    pub include_estimated_plan: bool,
    /// Maximum rows stored per result set. 0 means unbounded.
    pub row_count_limit: u64,
    /// Rows between two "result set updated" notifications.
    pub update_interval_rows: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            batch_execution_count: 1,
            include_actual_plan: false,
            include_estimated_plan: false,
            row_count_limit: 0,
            update_interval_rows: 1000,
        }
    }
}

impl ExecutionSettings {
    /// Returns the normalized execution count (at least 1).
    pub fn execution_count(&self) -> u32 {
        if self.batch_execution_count <= 0 {
            1
        } else {
            self.batch_execution_count as u32
        }
    }

    /// Returns the per-result-set row limit, or `None` when unbounded.
    pub fn row_limit(&self) -> Option<u64> {
        (self.row_count_limit > 0).then_some(self.row_count_limit)
    }

    /// Returns the update interval, never less than one row.
    pub fn update_interval(&self) -> u64 {
        self.update_interval_rows.max(1)
    }

    /// Merges a more specific settings layer over these settings.
    ///
    /// Counts and limits are taken from `other`; plan flags are OR-combined
    /// so that a plan requested at any layer is captured.
    pub fn merged_with(&self, other: &ExecutionSettings) -> ExecutionSettings {
        ExecutionSettings {
            batch_execution_count: other.batch_execution_count,
            include_actual_plan: self.include_actual_plan || other.include_actual_plan,
            include_estimated_plan: self.include_estimated_plan || other.include_estimated_plan,
            row_count_limit: other.row_count_limit,
            update_interval_rows: other.update_interval_rows,
        }
    }

    /// OR-combines request-scoped plan flags into these settings.
    pub fn with_plan_flags(mut self, actual: bool, estimated: bool) -> Self {
        self.include_actual_plan |= actual;
        self.include_estimated_plan |= estimated;
        self
    }
}

/// Row buffer backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Rows are kept in process memory.
    Memory,
    /// Rows are spooled to temporary files.
    #[default]
    File,
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend used for result set rows.
    pub kind: StorageKind,
    /// Directory for row files. Defaults to the OS temporary directory.
    pub directory: Option<PathBuf>,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level.
    pub level: String,
    /// `compact` or `json`.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact text: timestamp LEVEL target message
    #[default]
    Compact,
    /// JSON Lines for structured log collection
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.execution.execution_count(), 1);
        assert_eq!(config.execution.row_limit(), None);
        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn test_parse_sections() {
        let config = ServiceConfig::from_toml(
            r#"
            [execution]
            batch_execution_count = 3
            include_estimated_plan = true
            row_count_limit = 500

            [storage]
            kind = "memory"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.execution_count(), 3);
        assert!(config.execution.include_estimated_plan);
        assert_eq!(config.execution.row_limit(), Some(500));
        assert_eq!(config.execution.update_interval(), 1000);
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_level() {
        let result = ServiceConfig::from_toml("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "logging.level",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_update_interval() {
        let result = ServiceConfig::from_toml("[execution]\nupdate_interval_rows = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_missing_storage_directory() {
        let result = ServiceConfig::from_toml(
            "[storage]\nkind = \"file\"\ndirectory = \"/definitely/not/here\"\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "storage.directory",
                ..
            })
        ));
    }

    #[test]
    fn test_unparseable_config() {
        assert!(matches!(
            ServiceConfig::from_toml("[execution\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_execution_count_normalized() {
        let mut settings = ExecutionSettings::default();
        settings.batch_execution_count = 0;
        assert_eq!(settings.execution_count(), 1);
        settings.batch_execution_count = -4;
        assert_eq!(settings.execution_count(), 1);
        settings.batch_execution_count = 7;
        assert_eq!(settings.execution_count(), 7);
    }

    #[test]
    fn test_merge_ors_plan_flags() {
        let global = ExecutionSettings {
            include_actual_plan: true,
            ..ExecutionSettings::default()
        };
        let owner = ExecutionSettings {
            batch_execution_count: 4,
            include_estimated_plan: true,
            row_count_limit: 10,
            ..ExecutionSettings::default()
        };

        let merged = global.merged_with(&owner);
        assert!(merged.include_actual_plan);
        assert!(merged.include_estimated_plan);
        assert_eq!(merged.execution_count(), 4);
        assert_eq!(merged.row_limit(), Some(10));

        // Request flags never clear persisted ones
        let merged = merged.with_plan_flags(false, false);
        assert!(merged.include_actual_plan);
        assert!(merged.include_estimated_plan);
    }
}
