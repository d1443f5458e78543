//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::schema::RemoteKind;
use crate::config::{Config, ConfigManager};
use crate::error::{CacheprogError, CacheprogResult};
use console::style;
use std::path::PathBuf;

const VALID_KEYS: &[&str] = &[
    "general.verbose",
    "general.log_format",
    "general.log_errors",
    "local.dir",
    "remote.kind",
    "remote.url",
    "remote.prefix",
    "remote.token_env",
    "remote.timeout_secs",
    "remote.ttl_secs",
    "remote.max_body_bytes",
    "metrics.enabled",
];

/// Execute the config command
///
/// `config` is the effective configuration, command-line overrides included.
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> CacheprogResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> CacheprogResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> CacheprogResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        eprintln!(
            "{} Config already exists at {}",
            style("!").yellow(),
            path.display()
        );
        eprintln!("  Use --force to overwrite");
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    eprintln!(
        "{} Configuration initialized: {}",
        style("✓").green(),
        path.display()
    );

    Ok(())
}

/// Update one key in the config file, leaving command-line overrides out of it
async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> CacheprogResult<()> {
    let mut config = manager.load().await?;
    apply_value(&mut config, key, value)?;
    manager.save(&config).await?;

    eprintln!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

fn apply_value(config: &mut Config, key: &str, value: &str) -> CacheprogResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "verbose"] => config.general.verbose = parse_bool(value)?,
        ["general", "log_format"] => {
            if value != "text" && value != "json" {
                return Err(CacheprogError::User(format!(
                    "Invalid log format: {}. Use text/json",
                    value
                )));
            }
            config.general.log_format = value.to_string();
        }
        ["general", "log_errors"] => config.general.log_errors = parse_bool(value)?,

        ["local", "dir"] => config.local.dir = PathBuf::from(value),

        ["remote", "kind"] => config.remote.kind = parse_kind(value)?,
        ["remote", "url"] => config.remote.url = optional(value),
        ["remote", "prefix"] => config.remote.prefix = value.to_string(),
        ["remote", "token_env"] => config.remote.token_env = optional(value),
        ["remote", "timeout_secs"] => config.remote.timeout_secs = parse_u64(value)?,
        ["remote", "ttl_secs"] => config.remote.ttl_secs = parse_u64(value)?,
        ["remote", "max_body_bytes"] => config.remote.max_body_bytes = parse_u64(value)?,

        ["metrics", "enabled"] => config.metrics.enabled = parse_bool(value)?,

        _ => {
            return Err(CacheprogError::User(format!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }

    Ok(())
}

/// Empty string clears an optional value
fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(value: &str) -> CacheprogResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CacheprogError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_u64(value: &str) -> CacheprogResult<u64> {
    value
        .parse()
        .map_err(|_| CacheprogError::User(format!("Invalid number: {}", value)))
}

fn parse_kind(value: &str) -> CacheprogResult<RemoteKind> {
    match value {
        "none" => Ok(RemoteKind::None),
        "memory" => Ok(RemoteKind::Memory),
        "http" => Ok(RemoteKind::Http),
        _ => Err(CacheprogError::User(format!(
            "Invalid remote kind: {}. Use none/memory/http",
            value
        ))),
    }
}
