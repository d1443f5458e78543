//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// cacheprog - tiered build cache daemon
///
/// Speaks the line-delimited JSON cache program protocol on stdin/stdout,
/// serving entries from a local directory backed by an optional remote tier.
#[derive(Parser, Debug)]
#[command(name = "cacheprog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace every message)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CACHEPROG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local cache directory (overrides [local] dir)
    #[arg(long, global = true, env = "CACHEPROG_DIR")]
    pub dir: Option<PathBuf>,

    /// Base URL of an HTTP remote tier (implies [remote] kind = "http")
    #[arg(long, global = true)]
    pub remote_url: Option<String>,

    /// Do not collect or report per-operation metrics
    #[arg(long, global = true)]
    pub no_metrics: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the cache protocol on stdin/stdout
    Serve,

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., remote.kind)
        key: String,
        /// Value to set
        value: String,
    },
}
