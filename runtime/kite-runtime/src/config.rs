///
/// # Runtime Configuration
///
/// Settings for a `Runtime`, read from a TOML file. Every section and field
/// is optional; missing values take the defaults below.
///
/// ```toml
/// [handles]
/// first_id = 1
///
/// [statements]
/// max_cache_size = 25        # 0 disables caching, at most 100
///
/// [sqlite]
/// busy_timeout_ms = 2500
/// cursor_window_bytes = 2097152
///
/// [dispatch]
/// default_transfer_mode = "checked"   # or "unchecked"
/// ```
///

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kite_core::TransferMode;
use kite_sqlite3::{ConnectionOptions, DEFAULT_CACHE_SIZE, DEFAULT_WINDOW_SIZE, MAX_CACHE_SIZE};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub handles: HandlesConfig,
    pub statements: StatementsConfig,
    pub sqlite: SqliteConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HandlesConfig {
    /// First id handed out by every table
    pub first_id: i32,
}

impl Default for HandlesConfig {
    fn default() -> Self {
        Self { first_id: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatementsConfig {
    pub max_cache_size: usize,
}

impl Default for StatementsConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub busy_timeout_ms: u64,
    pub cursor_window_bytes: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 2500,
            cursor_window_bytes: DEFAULT_WINDOW_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_transfer_mode: TransferMode,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RuntimeError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.handles.first_id < 1 {
            return Err(RuntimeError::Invalid(format!(
                "handles.first_id must be positive, got {}",
                self.handles.first_id
            )));
        }
        if self.statements.max_cache_size > MAX_CACHE_SIZE {
            return Err(RuntimeError::Invalid(format!(
                "statements.max_cache_size must be at most {}, got {}",
                MAX_CACHE_SIZE, self.statements.max_cache_size
            )));
        }
        if self.sqlite.cursor_window_bytes == 0 {
            return Err(RuntimeError::Invalid(
                "sqlite.cursor_window_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            busy_timeout: Duration::from_millis(self.sqlite.busy_timeout_ms),
            max_cache_size: self.statements.max_cache_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.handles.first_id, 1);
        assert_eq!(config.statements.max_cache_size, 25);
        assert_eq!(config.sqlite.cursor_window_bytes, 2 * 1024 * 1024);
        assert_eq!(config.dispatch.default_transfer_mode, TransferMode::Checked);
    }

    #[test]
    fn test_partial_sections() {
        let config = RuntimeConfig::from_toml_str(
            r#"
[statements]
max_cache_size = 0

[dispatch]
default_transfer_mode = "unchecked"
"#,
        )
        .unwrap();
        assert_eq!(config.statements.max_cache_size, 0);
        assert_eq!(config.dispatch.default_transfer_mode, TransferMode::Unchecked);
        assert_eq!(config.sqlite.busy_timeout_ms, 2500);
    }

    #[test]
    fn test_connection_options() {
        let config = RuntimeConfig::from_toml_str("[sqlite]\nbusy_timeout_ms = 40\n").unwrap();
        let options = config.connection_options();
        assert_eq!(options.busy_timeout, Duration::from_millis(40));
        assert_eq!(options.max_cache_size, 25);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RuntimeConfig::from_toml_str("[statements]\nmax_cache_size = 101\n").unwrap_err();
        assert!(matches!(err, RuntimeError::Invalid(_)));
        assert!(err.to_string().contains("max_cache_size"));

        let err = RuntimeConfig::from_toml_str("[handles]\nfirst_id = 0\n").unwrap_err();
        assert!(matches!(err, RuntimeError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = RuntimeConfig::from_toml_str("[dispatch]\ndefault_transfer_mode = \"sometimes\"\n")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/kite.toml")).unwrap_err();
        assert!(matches!(err, RuntimeError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/kite.toml"));
    }
}
