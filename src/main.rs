//! cacheprog - tiered build cache daemon
//!
//! CLI entry point that dispatches to subcommands.

use cacheprog::cli::{Cli, Commands};
use cacheprog::config::schema::RemoteKind;
use cacheprog::config::{Config, ConfigManager};
use cacheprog::error::CacheprogResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status after a malformed or truncated input stream
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CacheprogResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    apply_overrides(&cli, &mut config);

    init_logging(cli.verbose, &config);

    match cli.command {
        Some(Commands::Config(args)) => {
            cacheprog::cli::commands::config(args, &config_manager, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
        None | Some(Commands::Serve) => match cacheprog::cli::commands::serve(&config).await? {
            Ok(_) => Ok(ExitCode::SUCCESS),
            Err(fatal) => {
                eprintln!("{} {}", style("Error:").red().bold(), fatal);
                Ok(ExitCode::from(EXIT_FATAL))
            }
        },
    }
}

/// Command-line flags win over the config file
fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(dir) = &cli.dir {
        config.local.dir = dir.clone();
    }
    if let Some(url) = &cli.remote_url {
        config.remote.kind = RemoteKind::Http;
        config.remote.url = Some(url.clone());
    }
    if cli.no_metrics {
        config.metrics.enabled = false;
    }
}

/// Logs go to stderr; stdout carries the protocol
fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn plus the metrics report, 1 = info, 2 = debug, 3+ = trace (every message)
    let level = match verbose {
        0 if config.general.verbose => "cacheprog=info",
        0 => "cacheprog=warn,cacheprog::metrics=info",
        1 => "cacheprog=info",
        2 => "cacheprog=debug",
        _ => "cacheprog=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.with_target(false).without_time().init();
    }
}
