// Configuration file for the winnat CLI

use crate::drivers::DriverConfig;
use crate::mapping::PortMapping;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "winnat";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_DRIVER: &str = "Netsh";

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Driver name handed to the factory
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Driver options (`NatAdapter`, `BatchMode`, `NatName`, ...)
    #[serde(default)]
    pub options: DriverConfig,

    /// Mappings created by `winnat apply`
    #[serde(default)]
    pub mappings: Vec<PortMapping>,
}

fn default_driver() -> String {
    DEFAULT_DRIVER.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            options: DriverConfig::new(),
            mappings: Vec::new(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join(CONFIG_DIR);
        Ok(config_dir.join(CONFIG_FILE))
    }

    /// `explicit` when given, otherwise the default location
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::config_path(),
        }
    }

    /// Load configuration from disk; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_json::from_str(&contents)
            .context(format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to disk, creating the parent directory
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Record a mapping for `apply`, replacing one with the same external endpoint
    pub fn remember(&mut self, mapping: PortMapping) {
        self.forget(&mapping);
        self.mappings.push(PortMapping {
            external_id: String::new(),
            ..mapping
        });
    }

    /// Drop recorded mappings with the same protocol and external endpoint
    pub fn forget(&mut self, mapping: &PortMapping) -> bool {
        let before = self.mappings.len();
        self.mappings.retain(|m| !m.same_external(mapping));
        self.mappings.len() != before
    }

    /// Override a driver option
    pub fn set_option(&mut self, key: &str, value: impl Into<Value>) {
        self.options.insert(key.to_string(), value.into());
    }
}
