//! Configuration loader

use crate::config::Config;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Configuration loader for various formats
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        tracing::debug!("📄 Loading configuration from {}", path.display());

        match ext {
            "json" => Self::from_json(&content),
            "toml" | "" => Self::from_toml(&content),
            _ => Err(Error::Config(format!("Unknown config format: {}", ext))),
        }
    }

    /// Load the given file, the per-user default file, or built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                tracing::debug!("📄 No config file found, using defaults");
                Ok(Config::default())
            }
        }
    }

    /// Default config location (`$XDG_CONFIG_HOME/pagesgate/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pagesgate").join("config.toml"))
    }

    /// Parse JSON configuration
    pub fn from_json(content: &str) -> Result<Config> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid JSON: {}", e)))
    }

    /// Parse TOML configuration
    pub fn from_toml(content: &str) -> Result<Config> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }
}
