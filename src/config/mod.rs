//! Configuration management for cacheprog
//!
//! One TOML file, optional. Every section falls back to its defaults, and
//! command-line flags are applied on top by the caller, never written back.

pub mod schema;

pub use schema::Config;

use crate::error::{CacheprogError, CacheprogResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Reads and writes the config file at a fixed path
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cacheprog")
            .join("config.toml")
    }

    /// Load the config file, or defaults when there is none
    ///
    /// A daemon started by a build tool usually has no config file at all, so
    /// absence is not an error. A file that exists but does not parse is.
    pub async fn load(&self) -> CacheprogResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Parse `path`, reporting it in [`CacheprogError::ConfigInvalid`] on failure
    pub async fn load_from_file(&self, path: &Path) -> CacheprogResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheprogError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| CacheprogError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write `config` as pretty TOML, creating the parent directory
    ///
    /// Used by `config init` and `config set`; overrides from the command line
    /// are never part of `config`.
    pub async fn save(&self, config: &Config) -> CacheprogResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            CacheprogError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> CacheprogResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheprogError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Path printed by `config path`
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
