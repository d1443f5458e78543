//! Storage abstraction and the store chain
//!
//! Every store implements [`Storage`]. Decorators own an inner store and
//! forward each call, so the daemon runs a chain such as
//! `MetricsStorage(LoggingStorage(TieredStorage(LocalStore, remote)))`.
//!
//! Stores must tolerate concurrent calls: the engine runs every get and put
//! as its own task and never serializes requests for the same key.

mod factory;
pub mod local;
pub mod logging;
pub mod metrics;
pub mod tiered;

pub use factory::build_storage;
pub use local::LocalStore;
pub use logging::LoggingStorage;
pub use metrics::{MetricsReport, MetricsStorage};
pub use tiered::TieredStorage;

use crate::error::CacheprogResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// A byte stream, consumed at most once
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

/// Path- and key-safe name for a cache entry, derived from an action ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Derive the key for an action ID (lowercase hex, so distinct IDs never collide)
    pub fn from_action_id(action_id: &[u8]) -> Self {
        Self(hex::encode(action_id))
    }

    /// Use an already-derived key as is
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that the key can be used as a single path segment
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cache hit
pub struct CacheEntry {
    pub output_id: Vec<u8>,
    /// Set when the body lives in a local file
    pub disk_path: Option<PathBuf>,
    pub body_size: u64,
    /// The body, when the store can hand it out
    pub body: Option<Body>,
    /// When the entry was written, if the store records it
    pub stored_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("output_id", &hex::encode(&self.output_id))
            .field("disk_path", &self.disk_path)
            .field("body_size", &self.body_size)
            .field("has_body", &self.body.is_some())
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

/// A write to the cache
pub struct PutRequest {
    pub key: StorageKey,
    pub output_id: Vec<u8>,
    pub body: Body,
    /// Declared length of `body`
    pub body_size: u64,
}

impl PutRequest {
    /// Build a put from bytes already in memory
    pub fn from_bytes(key: StorageKey, output_id: Vec<u8>, body: bytes::Bytes) -> Self {
        Self {
            key,
            output_id,
            body_size: body.len() as u64,
            body: Box::new(std::io::Cursor::new(body)),
        }
    }
}

impl fmt::Debug for PutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutRequest")
            .field("key", &self.key)
            .field("output_id", &hex::encode(&self.output_id))
            .field("body_size", &self.body_size)
            .finish_non_exhaustive()
    }
}

/// A cache store
///
/// `get` returns `Ok(None)` on a miss; errors are reserved for failures.
/// `put` returns the local path of the stored body when the store has one.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Look up an entry
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>>;

    /// Store an entry, fully replacing any previous entry for the key
    async fn put(
        &self,
        ctx: &CancellationToken,
        request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>>;

    /// Flush and release resources; no calls follow
    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        (**self).get(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        (**self).put(ctx, request).await
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        (**self).close(ctx).await
    }
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        (**self).get(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        (**self).put(ctx, request).await
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        (**self).close(ctx).await
    }
}
