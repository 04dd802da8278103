//! Configuration management for pluginhost.
//!
//! Handles loading configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{PluginError, PluginResult, DEFAULT_ARCHIVE_EXTENSION};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin subsystem settings
    pub plugins: PluginConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Plugin subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory scanned for plugin archives (`~` is expanded)
    pub directory: PathBuf,

    /// File extension of plugin archives, without the leading dot
    pub extension: String,

    /// Seconds between background rescans
    pub rescan_interval_secs: u64,

    /// Upper bound for a single `start`/`stop` call, in milliseconds
    pub call_timeout_ms: u64,

    /// Wait before releasing a stopped plugin's loading context, in milliseconds
    pub unload_grace_ms: u64,

    /// Unload and remove plugins once they are stopped
    pub unload_on_stop: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.pluginhost.toml` in current directory
    /// 2. `~/.config/pluginhost/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".pluginhost.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pluginhost"))
    }
}

impl PluginConfig {
    /// Plugin directory with `~` expanded.
    pub fn resolved_directory(&self) -> PathBuf {
        let raw = self.directory.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&raw).into_owned())
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_millis(self.unload_grace_ms)
    }

    /// Reject values the subsystem cannot run with.
    pub fn validate(&self) -> PluginResult<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(PluginError::Config("plugin directory must not be empty".to_string()));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(PluginError::Config("archive extension must not be empty".to_string()));
        }
        if self.rescan_interval_secs == 0 {
            return Err(PluginError::Config("rescan interval must be positive".to_string()));
        }
        if self.call_timeout_ms == 0 {
            return Err(PluginError::Config("call timeout must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            extension: DEFAULT_ARCHIVE_EXTENSION.to_string(),
            rescan_interval_secs: 30,
            call_timeout_ms: 10_000,
            unload_grace_ms: 3_000,
            unload_on_stop: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.plugins.directory, PathBuf::from("plugins"));
        assert_eq!(config.plugins.rescan_interval(), Duration::from_secs(30));
        assert_eq!(config.plugins.unload_grace(), Duration::from_secs(3));
        assert!(config.plugins.unload_on_stop);
        assert_eq!(config.logging.level, "info");
        assert!(config.plugins.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[plugins]"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [plugins]
            directory = "/opt/plugins"
            call_timeout_ms = 250
            unload_on_stop = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("/opt/plugins"));
        assert_eq!(config.plugins.call_timeout(), Duration::from_millis(250));
        assert!(!config.plugins.unload_on_stop);
        // Unset keys keep their defaults.
        assert_eq!(config.plugins.rescan_interval_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_file_rejects_invalid_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[plugins\n").unwrap();

        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = PluginConfig { call_timeout_ms: 0, ..PluginConfig::default() };
        assert!(matches!(config.validate(), Err(PluginError::Config(_))));

        config.call_timeout_ms = 100;
        config.rescan_interval_secs = 0;
        assert!(config.validate().is_err());

        config.rescan_interval_secs = 1;
        config.extension = ".".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_directory_expands_tilde() {
        let config = PluginConfig { directory: PathBuf::from("~/plugins"), ..PluginConfig::default() };
        let resolved = config.resolved_directory();

        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join("plugins"));
        }
    }
}
