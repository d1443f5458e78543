//! Configuration schema for cacheprog
//!
//! Configuration is stored at `~/.config/cacheprog/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local tier settings
    pub local: LocalConfig,

    /// Remote tier settings
    pub remote: RemoteConfig,

    /// Metrics settings
    pub metrics: MetricsConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Log every failed store call
    pub log_errors: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
            log_errors: true,
        }
    }
}

/// Local tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding cached entries
    pub dir: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("cacheprog"),
        }
    }
}

/// Which remote tier to put behind the local one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// Local tier only
    #[default]
    None,
    /// In-process store, lives as long as the session
    Memory,
    /// HTTP key/value service
    Http,
}

/// Remote tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote backend
    pub kind: RemoteKind,

    /// Base URL of the HTTP service
    pub url: Option<String>,

    /// Key namespace within the service
    pub prefix: String,

    /// Environment variable holding a bearer token (optional)
    pub token_env: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Entry lifetime for the in-process store, in seconds (default: 7 days)
    pub ttl_secs: u64,

    /// Largest body accepted from the service
    pub max_body_bytes: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::None,
            url: None,
            prefix: String::new(),
            token_env: None,
            timeout_secs: 30,
            ttl_secs: 7 * 24 * 60 * 60,
            max_body_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collect and report store metrics on shutdown
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
