//! Store chain assembly
//!
//! Builds the chain the daemon serves from:
//! `Metrics? -> Logging? -> Tiered(Local, remote) | Local`.

use crate::config::schema::{RemoteConfig, RemoteKind};
use crate::config::Config;
use crate::error::{CacheprogError, CacheprogResult};
use crate::remote::{HttpRemote, MemoryRemote};
use crate::storage::{LocalStore, LoggingStorage, MetricsStorage, Storage, TieredStorage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Create the store chain described by `config`
pub async fn build_storage(config: &Config) -> CacheprogResult<Arc<dyn Storage>> {
    let local = LocalStore::open(&config.local.dir).await?;

    let mut storage: Arc<dyn Storage> = match config.remote.kind {
        RemoteKind::None => {
            debug!("Serving from local tier only");
            Arc::new(local)
        }
        RemoteKind::Memory => {
            let ttl = Duration::from_secs(config.remote.ttl_secs);
            debug!("Remote tier: in-process, ttl {:?}", ttl);
            Arc::new(TieredStorage::new(local, MemoryRemote::with_ttl(ttl)))
        }
        RemoteKind::Http => {
            let remote = http_remote(&config.remote)?;
            Arc::new(TieredStorage::new(local, remote))
        }
    };

    if config.general.log_errors {
        storage = Arc::new(LoggingStorage::new(storage));
    }
    if config.metrics.enabled {
        storage = Arc::new(MetricsStorage::new(storage));
    }

    Ok(storage)
}

fn http_remote(remote: &RemoteConfig) -> CacheprogResult<HttpRemote> {
    let url = remote
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| CacheprogError::ConfigMissing("remote.url for the http remote".to_string()))?;

    let token = match remote.token_env.as_deref() {
        Some(var) => match std::env::var(var) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!("Token variable {} is not set, connecting without credentials", var);
                None
            }
        },
        None => None,
    };

    debug!("Remote tier: http {}", url);
    Ok(HttpRemote::new(
        url,
        &remote.prefix,
        token,
        Duration::from_secs(remote.timeout_secs),
        remote.max_body_bytes,
    ))
}
