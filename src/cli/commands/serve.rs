//! Serve command - run the cache daemon on stdin/stdout

use crate::config::Config;
use crate::engine::{Engine, FatalError, Shutdown};
use crate::error::CacheprogResult;
use crate::storage::build_storage;
use tracing::{debug, info, warn};

/// Execute the serve command
///
/// The outer result covers startup (opening the store chain); the inner one
/// is how the session ended.
pub async fn execute(config: &Config) -> CacheprogResult<Result<Shutdown, FatalError>> {
    let storage = build_storage(config).await?;
    info!(
        "Serving cache from {} (remote: {:?})",
        config.local.dir.display(),
        config.remote.kind
    );

    let engine = Engine::new(storage, tokio::io::stdout());
    let outcome = engine.run(tokio::io::stdin()).await;

    if let Ok(shutdown) = &outcome {
        debug!(
            "Session ended: {} requests, close requested: {}",
            shutdown.requests, shutdown.close_requested
        );
        if let Some(e) = &shutdown.close_error {
            warn!("Store chain did not close cleanly: {}", e);
        }
    }

    Ok(outcome)
}
