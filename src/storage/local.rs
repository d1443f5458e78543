//! Local filesystem store
//!
//! Layout under the root directory:
//!
//! | Path | Contents |
//! |------|----------|
//! | `meta/<key>.json` | metadata record: key, output ID, size, body digest, time |
//! | `bodies/<sha256>` | body blob, named by the SHA256 of its contents |
//! | `tmp/` | staging area for atomic renames |
//!
//! A put stages the body, renames it into `bodies/`, then stages and renames
//! the metadata record. The metadata rename is the commit point: a reader
//! sees either the old record or the new one, and both name a body blob that
//! is complete and never rewritten in place.

use crate::error::{CacheprogError, CacheprogResult};
use crate::storage::{CacheEntry, PutRequest, Storage, StorageKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata record persisted next to each body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    #[serde(with = "crate::protocol::encoding")]
    output_id: Vec<u8>,
    size: u64,
    digest: String,
    stored_at: DateTime<Utc>,
}

/// Content-addressed store on a local directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> CacheprogResult<Self> {
        let dir = dir.as_ref();
        for sub in ["meta", "bodies", "tmp"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| CacheprogError::io(format!("creating {}", path.display()), e))?;
        }

        let root = fs::canonicalize(dir)
            .await
            .map_err(|e| CacheprogError::io(format!("resolving {}", dir.display()), e))?;

        debug!("Opened local store at {}", root.display());
        Ok(Self { root })
    }

    /// Absolute root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, key: &StorageKey) -> PathBuf {
        self.root.join("meta").join(format!("{}.json", key))
    }

    fn body_path(&self, digest: &str) -> PathBuf {
        self.root.join("bodies").join(digest)
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join("tmp").join(Uuid::new_v4().to_string())
    }

    async fn read_meta(&self, key: &StorageKey) -> CacheprogResult<Option<EntryMeta>> {
        let path = self.meta_path(key);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheprogError::io(
                    format!("reading metadata {}", path.display()),
                    e,
                ))
            }
        };

        match serde_json::from_slice::<EntryMeta>(&content) {
            Ok(meta) if meta.key == key.as_str() => Ok(Some(meta)),
            Ok(meta) => {
                warn!(
                    "Metadata {} records key {}, treating as miss",
                    path.display(),
                    meta.key
                );
                Ok(None)
            }
            Err(e) => {
                warn!("Unreadable metadata {}: {}, treating as miss", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Stream `request.body` into a staging file, returning (path, digest, bytes written)
    async fn stage_body(&self, request: &mut PutRequest) -> CacheprogResult<(PathBuf, String, u64)> {
        let staging = self.staging_path();
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| CacheprogError::io(format!("creating {}", staging.display()), e))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        let copied: std::io::Result<()> = async {
            loop {
                let n = request.body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            file.sync_all().await
        }
        .await;

        if let Err(e) = copied {
            discard(&staging).await;
            return Err(CacheprogError::io(
                format!("writing body for {}", request.key),
                e,
            ));
        }

        Ok((staging, hex::encode(hasher.finalize()), written))
    }

    async fn commit(&self, staging: &Path, target: &Path) -> CacheprogResult<()> {
        if let Err(e) = fs::rename(staging, target).await {
            discard(staging).await;
            return Err(CacheprogError::io(
                format!("renaming into {}", target.display()),
                e,
            ));
        }
        Ok(())
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove staging file {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl Storage for LocalStore {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<CacheEntry>> {
        if ctx.is_cancelled() {
            return Err(CacheprogError::Cancelled);
        }
        if !key.is_path_safe() {
            return Ok(None);
        }

        let Some(meta) = self.read_meta(key).await? else {
            return Ok(None);
        };

        let body_path = self.body_path(&meta.digest);
        let file = match fs::File::open(&body_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Body {} missing for key {}, treating as miss", meta.digest, key);
                return Ok(None);
            }
            Err(e) => {
                return Err(CacheprogError::io(
                    format!("opening body {}", body_path.display()),
                    e,
                ))
            }
        };

        let on_disk = file
            .metadata()
            .await
            .map_err(|e| CacheprogError::io(format!("inspecting {}", body_path.display()), e))?
            .len();
        if on_disk != meta.size {
            return Err(CacheprogError::integrity(
                key.as_str(),
                format!("metadata size {} but body has {} bytes", meta.size, on_disk),
            ));
        }

        Ok(Some(CacheEntry {
            output_id: meta.output_id,
            disk_path: Some(body_path),
            body_size: meta.size,
            body: Some(Box::new(file)),
            stored_at: Some(meta.stored_at),
        }))
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        mut request: PutRequest,
    ) -> CacheprogResult<Option<PathBuf>> {
        if request.key.is_empty() {
            return Err(CacheprogError::EmptyKey);
        }
        if !request.key.is_path_safe() {
            return Err(CacheprogError::InvalidKey(request.key.to_string()));
        }
        if ctx.is_cancelled() {
            return Err(CacheprogError::Cancelled);
        }

        let (staged_body, digest, written) = self.stage_body(&mut request).await?;
        if written != request.body_size {
            discard(&staged_body).await;
            return Err(CacheprogError::SizeMismatch {
                key: request.key.to_string(),
                expected: request.body_size,
                actual: written,
            });
        }

        let body_path = self.body_path(&digest);
        self.commit(&staged_body, &body_path).await?;

        let meta = EntryMeta {
            key: request.key.to_string(),
            output_id: request.output_id,
            size: written,
            digest,
            stored_at: Utc::now(),
        };
        let staged_meta = self.staging_path();
        if let Err(e) = fs::write(&staged_meta, serde_json::to_vec(&meta)?).await {
            discard(&staged_meta).await;
            return Err(CacheprogError::io(
                format!("writing metadata for {}", request.key),
                e,
            ));
        }
        self.commit(&staged_meta, &self.meta_path(&request.key))
            .await?;

        debug!("Stored {} ({} bytes) at {}", request.key, written, body_path.display());
        Ok(Some(body_path))
    }

    async fn close(&self, _ctx: &CancellationToken) -> CacheprogResult<()> {
        Ok(())
    }
}
