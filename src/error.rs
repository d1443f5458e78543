//! Error types for cacheprog
//!
//! All storage and configuration code returns `CacheprogResult<T>`. Errors that
//! end the protocol session are modeled separately by
//! [`FatalError`](crate::engine::FatalError).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cacheprog operations
pub type CacheprogResult<T> = Result<T, CacheprogError>;

/// All recoverable errors that can occur in cacheprog
#[derive(Error, Debug)]
pub enum CacheprogError {
    // Request errors
    #[error("empty key")]
    EmptyKey,

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("invalid body size {0}")]
    InvalidBodySize(i64),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    // Integrity errors
    #[error("body size mismatch for key {key}: declared {expected} bytes, got {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("integrity error for key {key}: {reason}")]
    Integrity { key: String, reason: String },

    // Backend errors
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: Box<CacheprogError>,
    },

    #[error("remote store error: {context}: {reason}")]
    Remote { context: String, reason: String },

    #[error("{}", join_errors(.0))]
    Close(Vec<CacheprogError>),

    #[error("operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl CacheprogError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an error from an inner store with the operation that failed
    pub fn backend(context: impl Into<String>, source: CacheprogError) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Create a remote store error
    pub fn remote(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Remote {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an integrity error for a key
    pub fn integrity(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error means stored data disagrees with itself
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::SizeMismatch { .. } | Self::Integrity { .. } => true,
            Self::Backend { source, .. } => source.is_integrity(),
            Self::Close(errors) => errors.iter().any(Self::is_integrity),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: cacheprog config show"),
            Self::ConfigMissing(_) => Some("Run: cacheprog config path, then edit that file"),
            Self::User(_) => Some("Run: cacheprog config --help"),
            Self::Remote { .. } => Some("Check [remote] url and token_env in the config file"),
            Self::ConfigDirCreate { .. } | Self::Io { .. } => {
                Some("Check permissions of the cache directory (--dir)")
            }
            _ => None,
        }
    }
}

fn join_errors(errors: &[CacheprogError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
