//! Two-tier store: a local tier in front of a remote one
//!
//! Reads go to the local tier first and only fall through to the remote on a
//! miss; a remote hit is copied into the local tier before it is returned, so
//! every hit has a disk path. Writes land in the local tier before the put
//! returns and are forwarded to the remote in the background. `close` waits
//! for those background writes.
//!
//! The read path is not one critical section: a put racing a get for the
//! same key may be observed by that get either before or after it lands.
//! Local writes of a key are serialized through a striped lock, and a
//! backfill re-checks the local tier under that lock, so a remote copy never
//! replaces an entry put while the remote was being read.

use crate::error::{CacheprogError, CacheprogResult};
use crate::remote::{RemoteMeta, RemoteStore};
use crate::storage::{CacheEntry, PutRequest, Storage, StorageKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on the buffer reserved up front from a declared body size
const MAX_PREALLOCATED_BODY: u64 = 16 * 1024 * 1024;

const WRITE_LOCK_STRIPES: usize = 64;

/// Local tier + remote tier composed into one store
pub struct TieredStorage {
    local: Arc<dyn Storage>,
    remote: Arc<dyn RemoteStore>,
    uploads: Mutex<JoinSet<()>>,
    write_locks: Vec<Mutex<()>>,
}

impl TieredStorage {
    /// Compose `local` (fast, authoritative for reads) with `remote`
    pub fn new(local: impl Storage + 'static, remote: impl RemoteStore + 'static) -> Self {
        Self {
            local: Arc::new(local),
            remote: Arc::new(remote),
            uploads: Mutex::new(JoinSet::new()),
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of remote writes not yet collected
    pub async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }

    fn write_lock(&self, key: &StorageKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.write_locks[(hasher.finish() as usize) % WRITE_LOCK_STRIPES]
    }

    async fn backfill(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        let remote_entry = self
            .remote
            .get(ctx, key)
            .await
            .map_err(|e| CacheprogError::backend(format!("remote get {}", key), e))?;
        let Some(remote_entry) = remote_entry else {
            return Ok(None);
        };

        let Some(body) = remote_entry.body else {
            return Err(CacheprogError::integrity(
                key.as_str(),
                "remote hit without a readable body",
            ));
        };
        if body.len() as u64 != remote_entry.meta.size {
            return Err(CacheprogError::integrity(
                key.as_str(),
                format!(
                    "remote metadata size {} but body has {} bytes",
                    remote_entry.meta.size,
                    body.len()
                ),
            ));
        }

        let _guard = self.write_lock(key).lock().await;
        let landed = self
            .local
            .get(ctx, key)
            .await
            .map_err(|e| CacheprogError::backend(format!("local get {}", key), e))?;
        if let Some(entry) = landed {
            debug!("{} was written locally during remote read, skipping backfill", key);
            return Ok(Some(entry));
        }

        self.local
            .put(
                ctx,
                PutRequest::from_bytes(key.clone(), remote_entry.meta.output_id, body),
            )
            .await
            .map_err(|e| CacheprogError::backend(format!("backfilling {}", key), e))?;
        debug!("Backfilled {} from remote tier", key);

        match self.local.get(ctx, key).await {
            Ok(Some(entry)) => Ok(Some(entry)),
            Ok(None) => Err(CacheprogError::integrity(
                key.as_str(),
                "entry missing from local tier after backfill",
            )),
            Err(e) => Err(CacheprogError::backend(
                format!("local get {} after backfill", key),
                e,
            )),
        }
    }
}

#[async_trait]
impl Storage for TieredStorage {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        if key.is_empty() {
            return Ok(None);
        }

        let local = self
            .local
            .get(ctx, key)
            .await
            .map_err(|e| CacheprogError::backend(format!("local get {}", key), e))?;
        if let Some(entry) = local {
            return Ok(Some(entry));
        }

        self.backfill(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        mut request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        if request.key.is_empty() {
            return Err(CacheprogError::EmptyKey);
        }

        // The body stream is read once; both tiers get the buffered copy.
        let mut buf = Vec::with_capacity(request.body_size.min(MAX_PREALLOCATED_BODY) as usize);
        request
            .body
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CacheprogError::io(format!("reading body for {}", request.key), e))?;
        let body = Bytes::from(buf);

        let key = request.key;
        let output_id = request.output_id;
        let local = {
            let _guard = self.write_lock(&key).lock().await;
            self.local
                .put(
                    ctx,
                    PutRequest {
                        key: key.clone(),
                        output_id: output_id.clone(),
                        body: Box::new(std::io::Cursor::new(body.clone())),
                        body_size: request.body_size,
                    },
                )
                .await
                .map_err(|e| CacheprogError::backend(format!("local put {}", key), e))
        };

        // Data the local tier rejected as inconsistent never goes remote.
        // Other local failures still leave the remote tier a good copy.
        let consistent = body.len() as u64 == request.body_size;
        let forward = match &local {
            Ok(_) => true,
            Err(e) if e.is_integrity() || !consistent => false,
            Err(e) => {
                warn!("{}; forwarding {} to remote tier anyway", e, key);
                true
            }
        };
        if !forward {
            return local;
        }

        let remote = self.remote.clone();
        let ctx = ctx.clone();
        let meta = RemoteMeta {
            output_id,
            size: body.len() as u64,
        };
        let mut uploads = self.uploads.lock().await;
        while uploads.try_join_next().is_some() {}
        uploads.spawn(async move {
            if let Err(e) = remote.put(&ctx, &key, body, meta).await {
                warn!("Remote write for {} failed: {}", key, e);
            }
        });

        local
    }

    async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
        let mut uploads = std::mem::take(&mut *self.uploads.lock().await);
        if !uploads.is_empty() {
            debug!("Waiting for {} remote writes", uploads.len());
        }
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                warn!("Remote write task failed: {}", e);
            }
        }

        let mut errors = Vec::new();
        if let Err(e) = self.local.close(ctx).await {
            errors.push(CacheprogError::backend("closing local store", e));
        }
        if let Err(e) = self.remote.close(ctx).await {
            errors.push(CacheprogError::backend("closing remote store", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheprogError::Close(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteEntry};
    use crate::storage::LocalStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Remote wrapping a [`MemoryRemote`] with switchable failures
    #[derive(Default)]
    struct ScriptedRemote {
        inner: MemoryRemote,
        fail_gets: AtomicBool,
        fail_puts: AtomicBool,
        drop_bodies: AtomicBool,
        fail_close: AtomicBool,
        put_delay_ms: AtomicUsize,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for ScriptedRemote {
        async fn get(
            &self,
            ctx: &CancellationToken,
            key: &StorageKey,
        ) -> CacheprogResult<Option<RemoteEntry>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail_gets.load(Ordering::SeqCst) {
                return Err(CacheprogError::remote("get", "LihuaJones"));
            }
            let mut entry = self.inner.get(ctx, key).await?;
            if self.drop_bodies.load(Ordering::SeqCst) {
                if let Some(entry) = entry.as_mut() {
                    entry.body = None;
                }
            }
            Ok(entry)
        }

        async fn put(
            &self,
            ctx: &CancellationToken,
            key: &StorageKey,
            body: Bytes,
            meta: RemoteMeta,
        ) -> CacheprogResult<()> {
            let delay = self.put_delay_ms.load(Ordering::SeqCst) as u64;
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(CacheprogError::remote("put", "refused"));
            }
            self.inner.put(ctx, key, body, meta).await
        }

        async fn close(&self, ctx: &CancellationToken) -> CacheprogResult<()> {
            self.inner.close(ctx).await?;
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(CacheprogError::remote("close", "connection reset"));
            }
            Ok(())
        }
    }

    /// Local tier that fails every call
    struct BrokenLocal;

    #[async_trait]
    impl Storage for BrokenLocal {
        async fn get(
            &self,
            _ctx: &CancellationToken,
            _key: &StorageKey,
        ) -> CacheprogResult<Option<CacheEntry>> {
            Err(CacheprogError::Internal("disk gone".to_string()))
        }

        async fn put(
            &self,
            _ctx: &CancellationToken,
            _request: PutRequest,
        ) -> CacheprogResult<Option<PathBuf>> {
            Err(CacheprogError::Internal("disk gone".to_string()))
        }

        async fn close(&self, _ctx: &CancellationToken) -> CacheprogResult<()> {
            Err(CacheprogError::Internal("disk gone".to_string()))
        }
    }

    async fn tiered(temp: &TempDir) -> (TieredStorage, Arc<ScriptedRemote>) {
        let remote = Arc::new(ScriptedRemote::default());
        let local = LocalStore::open(temp.path()).await.unwrap();
        (TieredStorage::new(local, remote.clone()), remote)
    }

    fn put_request(key: &str, output_id: &[u8], body: &'static [u8]) -> PutRequest {
        PutRequest::from_bytes(
            StorageKey::new(key),
            output_id.to_vec(),
            Bytes::from_static(body),
        )
    }

    async fn seed_remote(remote: &ScriptedRemote, key: &str, output_id: &[u8], body: &'static [u8]) {
        remote
            .inner
            .put(
                &CancellationToken::new(),
                &StorageKey::new(key),
                Bytes::from_static(body),
                RemoteMeta {
                    output_id: output_id.to_vec(),
                    size: body.len() as u64,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn miss_in_both_tiers() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();

        let entry = storage.get(&ctx, &StorageKey::new("fOwaAFKWb")).await.unwrap();
        assert!(entry.is_none());
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
        storage.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn remote_hit_is_backfilled_with_disk_path() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        seed_remote(&remote, "fOwaAFKWb", b"MinRana", b"remote body").await;

        let entry = storage
            .get(&ctx, &StorageKey::new("fOwaAFKWb"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.output_id, b"MinRana");
        let disk_path = entry.disk_path.expect("backfilled entries live on disk");
        assert_eq!(std::fs::read(disk_path).unwrap(), b"remote body");

        // Second read is served locally even with the remote failing.
        remote.fail_gets.store(true, Ordering::SeqCst);
        let again = storage.get(&ctx, &StorageKey::new("fOwaAFKWb")).await.unwrap();
        assert!(again.is_some());
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_remote_body_backfills() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        seed_remote(&remote, "e0", b"MinRana", b"").await;

        let entry = storage.get(&ctx, &StorageKey::new("e0")).await.unwrap().unwrap();
        assert_eq!(entry.body_size, 0);
        assert!(entry.disk_path.is_some());
    }

    #[tokio::test]
    async fn remote_error_is_propagated_not_a_miss() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        remote.fail_gets.store(true, Ordering::SeqCst);

        let err = storage
            .get(&ctx, &StorageKey::new("fOwaAFKWb"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("remote get fOwaAFKWb"));
        assert!(err.to_string().contains("LihuaJones"));
    }

    #[tokio::test]
    async fn remote_hit_without_body_is_integrity_error() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        seed_remote(&remote, "ab", b"o", b"body").await;
        remote.drop_bodies.store(true, Ordering::SeqCst);

        let err = storage.get(&ctx, &StorageKey::new("ab")).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn local_error_is_propagated() {
        let remote = Arc::new(ScriptedRemote::default());
        let storage = TieredStorage::new(BrokenLocal, remote.clone());
        let ctx = CancellationToken::new();

        let err = storage.get(&ctx, &StorageKey::new("ab")).await.unwrap_err();
        assert!(err.to_string().contains("local get ab"));
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn put_returns_disk_path_and_reaches_remote_by_close() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();

        let disk_path = storage
            .put(&ctx, put_request("fOwaAFKWb", b"MinRana", b"payload"))
            .await
            .unwrap();
        assert!(disk_path.is_some());

        remote.fail_gets.store(true, Ordering::SeqCst);
        let entry = storage.get(&ctx, &StorageKey::new("fOwaAFKWb")).await.unwrap();
        assert!(entry.is_some());
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0);

        storage.close(&ctx).await.unwrap();
        assert!(remote.inner.contains(&StorageKey::new("fOwaAFKWb")));
    }

    #[tokio::test]
    async fn remote_put_failure_is_not_surfaced() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        remote.fail_puts.store(true, Ordering::SeqCst);

        storage
            .put(&ctx, put_request("ab", b"o", b"payload"))
            .await
            .unwrap();
        storage.close(&ctx).await.unwrap();
        assert!(!remote.inner.contains(&StorageKey::new("ab")));
    }

    #[tokio::test]
    async fn close_waits_for_slow_remote_writes() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();
        remote.put_delay_ms.store(30, Ordering::SeqCst);

        for i in 0..20 {
            storage
                .put(&ctx, put_request(&format!("k{}", i), b"o", b"body"))
                .await
                .unwrap();
        }
        storage.close(&ctx).await.unwrap();

        assert_eq!(remote.inner.len(), 20);
        assert_eq!(storage.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn rejected_local_write_never_reaches_remote() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();

        let mut request = put_request("ab", b"o", b"short");
        request.body_size = 64;
        let err = storage.put(&ctx, request).await.unwrap_err();
        assert!(err.is_integrity());

        storage.close(&ctx).await.unwrap();
        assert!(remote.inner.is_empty());
    }

    #[tokio::test]
    async fn local_write_failure_still_reaches_remote() {
        let remote = Arc::new(ScriptedRemote::default());
        let storage = TieredStorage::new(BrokenLocal, remote.clone());
        let ctx = CancellationToken::new();

        let err = storage
            .put(&ctx, put_request("ab", b"o", b"payload"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("local put ab"));

        // BrokenLocal also fails to close; only the upload matters here.
        let _ = storage.close(&ctx).await;
        assert!(remote.inner.contains(&StorageKey::new("ab")));
    }

    #[tokio::test]
    async fn get_racing_put_sees_one_version_whole() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let storage = Arc::new(storage);
        let ctx = CancellationToken::new();

        for round in 0..20 {
            let key = StorageKey::new(format!("race{}", round));
            seed_remote(&remote, key.as_str(), b"v0", b"old body").await;

            let (put_storage, put_ctx) = (storage.clone(), ctx.clone());
            let put_key = key.clone();
            let put = tokio::spawn(async move {
                put_storage
                    .put(
                        &put_ctx,
                        PutRequest::from_bytes(put_key, b"v1".to_vec(), Bytes::from_static(b"new body!")),
                    )
                    .await
            });
            let (get_storage, get_ctx) = (storage.clone(), ctx.clone());
            let get_key = key.clone();
            let get = tokio::spawn(async move {
                let mut entry = get_storage.get(&get_ctx, &get_key).await?.expect("seeded");
                let mut body = Vec::new();
                entry.body.take().expect("local body").read_to_end(&mut body).await.unwrap();
                CacheprogResult::Ok((entry.output_id, body))
            });

            put.await.unwrap().unwrap();
            let (output_id, body) = get.await.unwrap().unwrap();
            match output_id.as_slice() {
                b"v0" => assert_eq!(body, b"old body"),
                b"v1" => assert_eq!(body, b"new body!"),
                other => panic!("unexpected output id {:?}", other),
            }

            let mut settled = storage.get(&ctx, &key).await.unwrap().unwrap();
            assert_eq!(settled.output_id, b"v1");
            let mut body = Vec::new();
            settled.body.take().unwrap().read_to_end(&mut body).await.unwrap();
            assert_eq!(body, b"new body!");
        }

        storage.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn empty_key_put_fails_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let (storage, remote) = tiered(&temp).await;
        let ctx = CancellationToken::new();

        let err = storage.put(&ctx, put_request("", b"o", b"x")).await.unwrap_err();
        assert!(matches!(err, CacheprogError::EmptyKey));
        assert!(storage.get(&ctx, &StorageKey::new("")).await.unwrap().is_none());
        storage.close(&ctx).await.unwrap();
        assert!(remote.inner.is_empty());
    }

    #[tokio::test]
    async fn close_aggregates_errors_from_both_tiers() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.fail_close.store(true, Ordering::SeqCst);
        let storage = TieredStorage::new(BrokenLocal, remote.clone());

        let err = storage.close(&CancellationToken::new()).await.unwrap_err();
        match &err {
            CacheprogError::Close(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated close error, got {other:?}"),
        }
        let text = err.to_string();
        assert!(text.contains("disk gone"));
        assert!(text.contains("connection reset"));
    }
}
