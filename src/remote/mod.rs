//! Remote store collaborators
//!
//! A remote store is a shared key/value service sitting behind the local
//! tier. It sees whole bodies, never streams, and may expire entries on its
//! own schedule.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::error::CacheprogResult;
use crate::storage::StorageKey;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default expiry applied by remote stores (7 days)
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Metadata stored next to a remote body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMeta {
    #[serde(rename = "OutputID", with = "crate::protocol::encoding", default)]
    pub output_id: Vec<u8>,

    #[serde(rename = "Size", default)]
    pub size: u64,
}

/// A remote hit. `body` is `None` when the metadata exists but the body
/// could not be read; callers treat that as an integrity failure.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub meta: RemoteMeta,
    pub body: Option<Bytes>,
}

/// Shared key/value service holding cache entries
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch an entry; `Ok(None)` when absent or expired
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<RemoteEntry>>;

    /// Store an entry
    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
        body: Bytes,
        meta: RemoteMeta,
    ) -> CacheprogResult<()>;

    /// Release connections
    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()>;
}

#[async_trait]
impl<R: RemoteStore + ?Sized> RemoteStore for Arc<R> {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<RemoteEntry>> {
        (**self).get(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
        body: Bytes,
        meta: RemoteMeta,
    ) -> CacheprogResult<()> {
        (**self).put(ctx, key, body, meta).await
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        (**self).close(ctx).await
    }
}
