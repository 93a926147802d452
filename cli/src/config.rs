// Configuration management for the credreader CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/credreader/config.json
// - Linux: ~/.config/credreader/config.json
// - Windows: %APPDATA%\credreader\config.json

use anyhow::{Context, Result};
use credreader_core::crypto::CryptoError;
use credreader_core::{HandlerConfig, MasterKey, ValidationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No master key configured (pass --master-key or run `credreader config set master_key <hex>`)")]
    MissingMasterKey,
    #[error("Invalid master key: {0}")]
    InvalidMasterKey(#[from] CryptoError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Site master key, 32 hex characters
    #[serde(default)]
    pub master_key_hex: Option<String>,

    /// External validation endpoint
    #[serde(default)]
    pub validation: ValidationSettings,

    /// Failed credential decryptions allowed per authenticated session
    #[serde(default)]
    pub max_credential_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Serve the WebSocket validation endpoint
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Wait for a validator decision, in milliseconds
    pub timeout_ms: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8799,
            timeout_ms: 3000,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("credreader");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Master key from the command line flag, else from the config file
    pub fn master_key(&self, flag: Option<&str>) -> Result<MasterKey, ConfigError> {
        let hex = flag
            .or(self.master_key_hex.as_deref())
            .ok_or(ConfigError::MissingMasterKey)?;
        Ok(MasterKey::from_hex(hex.trim())?)
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            max_credential_attempts: self.max_credential_attempts,
        }
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig {
            timeout: Duration::from_millis(self.validation.timeout_ms),
            ..ValidationConfig::default()
        }
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "master_key" => {
                self.master_key_hex = if value.is_empty() {
                    None
                } else {
                    MasterKey::from_hex(value.trim()).map_err(ConfigError::from)?;
                    Some(value.trim().to_lowercase())
                };
            }
            "validation.enabled" => {
                self.validation.enabled = value.parse().context("Invalid boolean value")?;
            }
            "validation.host" => {
                self.validation.host = value.to_string();
            }
            "validation.port" => {
                self.validation.port = value.parse().context("Invalid port number")?;
            }
            "validation.timeout_ms" => {
                self.validation.timeout_ms = value.parse().context("Invalid number")?;
            }
            "max_credential_attempts" => {
                self.max_credential_attempts = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value. The master key itself is never echoed.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "master_key" => Some(self.master_key_summary()),
            "validation.enabled" => Some(self.validation.enabled.to_string()),
            "validation.host" => Some(self.validation.host.clone()),
            "validation.port" => Some(self.validation.port.to_string()),
            "validation.timeout_ms" => Some(self.validation.timeout_ms.to_string()),
            "max_credential_attempts" => Some(
                self.max_credential_attempts
                    .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
            ),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "master_key",
            "validation.enabled",
            "validation.host",
            "validation.port",
            "validation.timeout_ms",
            "max_credential_attempts",
        ]
        .into_iter()
        .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
        .collect()
    }

    fn master_key_summary(&self) -> String {
        match self.master_key(None) {
            Ok(key) => format!("set (fingerprint {})", key.fingerprint()),
            Err(ConfigError::MissingMasterKey) => "(not set)".to_string(),
            Err(ConfigError::InvalidMasterKey(_)) => "(invalid)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.master_key_hex.is_none());
        assert!(!config.validation.enabled);
        assert_eq!(config.validation.port, 8799);
        assert_eq!(config.validation_config().timeout, Duration::from_secs(3));
        assert_eq!(config.handler_config().max_credential_attempts, None);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_set_then_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("master_key", &KEY.to_uppercase()).unwrap();
        config.set("validation.port", "9000").unwrap();
        config.set("max_credential_attempts", "3").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.master_key_hex.as_deref(), Some(KEY));
        assert_eq!(reloaded.validation.port, 9000);
        assert_eq!(reloaded.max_credential_attempts, Some(3));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("master_key", "0011").is_err());
        assert!(config.set("validation.port", "port").is_err());
        assert!(config.set("nonsense", "1").is_err());
        assert!(config.master_key_hex.is_none());
    }

    #[test]
    fn test_flag_overrides_file() {
        let mut config = Config::default();
        assert!(matches!(config.master_key(None), Err(ConfigError::MissingMasterKey)));

        config.set("master_key", KEY).unwrap();
        let other = "ffeeddccbbaa99887766554433221100";
        let from_flag = config.master_key(Some(other)).unwrap();
        assert_eq!(from_flag.as_bytes(), &MasterKey::from_hex(other).unwrap().as_bytes()[..]);
        assert!(matches!(
            config.master_key(Some("zz")),
            Err(ConfigError::InvalidMasterKey(_))
        ));
    }

    #[test]
    fn test_get_never_reveals_key() {
        let mut config = Config::default();
        config.set("master_key", KEY).unwrap();
        let shown = config.get("master_key").unwrap();
        assert!(shown.starts_with("set (fingerprint "));
        assert!(!shown.contains(KEY));
    }
}
