//! In-process remote store
//!
//! Keeps entries in memory until their TTL passes. Serves as the remote tier
//! for single-session use and as a stand-in for a shared service in tests.

use crate::error::{CacheprogError, CacheprogResult};
use crate::remote::{RemoteEntry, RemoteMeta, RemoteStore, DEFAULT_TTL};
use crate::storage::StorageKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Stored {
    meta: RemoteMeta,
    body: Bytes,
    expires_at: Instant,
}

/// Remote store backed by a map with per-entry expiry
pub struct MemoryRemote {
    entries: Mutex<HashMap<String, Stored>>,
    ttl: Duration,
    closed: AtomicBool,
}

impl MemoryRemote {
    /// Create an empty store with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create an empty store whose entries expire after `ttl`
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|stored| stored.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether a live entry exists for `key`
    pub fn contains(&self, key: &StorageKey) -> bool {
        self.lock()
            .get(key.as_str())
            .is_some_and(|stored| stored.expires_at > Instant::now())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stored>> {
        // Entries are plain data; a panic elsewhere cannot leave one half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        if ctx.is_cancelled() {
            return Err(CacheprogError::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheprogError::remote("memory", "store is closed"));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<RemoteEntry>> {
        self.check_open(ctx)?;

        let mut entries = self.lock();
        let expired = match entries.get(key.as_str()) {
            None => return Ok(None),
            Some(stored) if stored.expires_at <= Instant::now() => true,
            Some(stored) => {
                return Ok(Some(RemoteEntry {
                    meta: stored.meta.clone(),
                    body: Some(stored.body.clone()),
                }))
            }
        };
        if expired {
            debug!("Remote entry {} expired", key);
            entries.remove(key.as_str());
        }
        Ok(None)
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
        body: Bytes,
        meta: RemoteMeta,
    ) -> CacheprogResult<()> {
        self.check_open(ctx)?;
        if key.is_empty() {
            return Err(CacheprogError::EmptyKey);
        }

        self.lock().insert(
            key.to_string(),
            Stored {
                meta,
                body,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn close(&self, _ctx: &CancellationToken) -> CacheprogResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
