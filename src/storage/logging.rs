//! Error-logging decorator

use crate::error::CacheprogResult;
use crate::storage::{CacheEntry, PutRequest, Storage, StorageKey};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Logs every failed call of the wrapped store; results pass through untouched
pub struct LoggingStorage<S> {
    inner: S,
}

impl<S: Storage> LoggingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: Storage> Storage for LoggingStorage<S> {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        let result = self.inner.get(ctx, key).await;
        match &result {
            Ok(Some(_)) => trace!(%key, "get hit"),
            Ok(None) => trace!(%key, "get miss"),
            Err(e) => warn!(%key, "get error: {}", e),
        }
        result
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        let key = request.key.clone();
        let result = self.inner.put(ctx, request).await;
        if let Err(e) = &result {
            warn!(%key, "put error: {}", e);
        }
        result
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        let result = self.inner.close(ctx).await;
        if let Err(e) = &result {
            warn!("close error: {}", e);
        }
        result
    }
}
