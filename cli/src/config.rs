// Configuration management for the blecentral CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blecentral/config.json
// - Linux: ~/.config/blecentral/config.json
// - Windows: %APPDATA%\blecentral\config.json

use anyhow::{Context, Result};
use blecentral_core::CentralConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which adapter to use when several are present
    pub adapter_index: usize,

    /// How long `scan` runs before stopping, in seconds
    pub scan_timeout_secs: u64,

    /// How long a connect may take before it is cancelled, in seconds
    pub connect_timeout_secs: u64,

    /// Let the platform reconnect in the background
    pub auto_connect: bool,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_timeout_secs: 10,
            connect_timeout_secs: 15,
            auto_connect: false,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blecentral");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory; call `save` to persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "adapter_index" => {
                self.adapter_index = value.parse().context("Invalid adapter index")?;
            }
            "scan_timeout_secs" => {
                self.scan_timeout_secs = value.parse().context("Invalid number")?;
            }
            "connect_timeout_secs" => {
                self.connect_timeout_secs = value.parse().context("Invalid number")?;
            }
            "auto_connect" => {
                self.auto_connect = value.parse().context("Invalid boolean value")?;
            }
            "log_level" => {
                self.log_level = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "adapter_index" => Some(self.adapter_index.to_string()),
            "scan_timeout_secs" => Some(self.scan_timeout_secs.to_string()),
            "connect_timeout_secs" => Some(self.connect_timeout_secs.to_string()),
            "auto_connect" => Some(self.auto_connect.to_string()),
            "log_level" => Some(self.log_level.clone()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("adapter_index".to_string(), self.adapter_index.to_string()),
            ("scan_timeout_secs".to_string(), format!("{}s", self.scan_timeout_secs)),
            ("connect_timeout_secs".to_string(), format!("{}s", self.connect_timeout_secs)),
            ("auto_connect".to_string(), self.auto_connect.to_string()),
            ("log_level".to_string(), self.log_level.clone()),
        ]
    }

    /// Settings handed to the central coordinator
    pub fn central(&self) -> CentralConfig {
        CentralConfig::default().with_auto_connect(self.auto_connect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.adapter_index, 0);
        assert!(!config.auto_connect);
        assert!(!config.central().connect.auto_connect);
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("auto_connect", "true").unwrap();
        config.set("scan_timeout_secs", "30").unwrap();
        assert_eq!(config.get("auto_connect").as_deref(), Some("true"));
        assert_eq!(config.get("scan_timeout_secs").as_deref(), Some("30"));
        assert!(config.central().connect.auto_connect);

        assert!(config.set("auto_connect", "maybe").is_err());
        assert!(config.set("listen_port", "1").is_err());
        assert_eq!(config.get("listen_port"), None);
    }

    #[test]
    fn test_load_creates_then_round_trips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        config.set("adapter_index", "2").unwrap();
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().adapter_index, 2);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"log_level":"debug"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.scan_timeout_secs, 10);
    }
}
