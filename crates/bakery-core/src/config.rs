//! Persistent engine configuration.
//!
//! Stored in `~/.bakery/config.json`. Every field has a default, so a missing
//! or partial file is fine.
//!
//! # Example
//!
//! ```no_run
//! use bakery_core::config::EngineConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = EngineConfig::load();
//! println!("entry section: [{}]", config.section_entry);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::variables::UndefinedPolicy;

const CONFIG_FILENAME: &str = "config.json";

pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Returns the bakery state directory (`~/.bakery/`), creating it if needed.
///
/// Falls back to `./.bakery` when the home directory is unknown.
pub fn bakery_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bakery");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting of `Run`/`Exec` section calls.
    pub max_call_depth: usize,
    /// What an undefined `%Name%` expands to.
    pub undefined_variables: UndefinedPolicy,
    /// Section run for each script by a build.
    pub section_entry: String,
    /// File extension of scripts when loading a directory.
    pub script_extension: String,
    /// Number of log entries kept in memory.
    pub log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            undefined_variables: UndefinedPolicy::Empty,
            section_entry: "Process".to_string(),
            script_extension: "script".to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> PathBuf {
        bakery_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.bakery/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_call_depth, 64);
        assert_eq!(config.undefined_variables, UndefinedPolicy::Empty);
        assert_eq!(config.section_entry, "Process");
        assert_eq!(config.script_extension, "script");
    }

    #[test]
    fn deserialize_partial_json() {
        let loaded: EngineConfig =
            serde_json::from_str(r#"{"undefined_variables":"literal","max_call_depth":8}"#).unwrap();
        assert_eq!(loaded.undefined_variables, UndefinedPolicy::Literal);
        assert_eq!(loaded.max_call_depth, 8);
        assert_eq!(loaded.section_entry, "Process");
    }

    #[test]
    fn roundtrip_through_file() {
        let path = std::env::temp_dir().join(format!("bakery-config-{}.json", uuid::Uuid::new_v4()));
        let config = EngineConfig {
            section_entry: "Build".to_string(),
            ..EngineConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        match EngineConfig::load_from(Path::new("/nonexistent/bakery/config.json")) {
            Err(ConfigError::Io(_)) => {}
            other => panic!("Expected Io error, got {other:?}"),
        }
    }
}
