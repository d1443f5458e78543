//! Remote store over plain HTTP
//!
//! Each entry is two objects under `{url}/cacheprog[/{prefix}]/{key}`:
//! the body at `-o` and the JSON metadata at `-i`. `GET` returning 404 is a
//! miss; `PUT` stores. Expiry is left to the server.

use crate::error::{CacheprogError, CacheprogResult};
use crate::remote::{RemoteEntry, RemoteMeta, RemoteStore};
use crate::storage::StorageKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Remote store speaking GET/PUT to a key/value HTTP service
pub struct HttpRemote {
    agent: ureq::Agent,
    base: String,
    token: Option<String>,
    max_body_bytes: u64,
}

impl HttpRemote {
    /// Create a client for the service at `url`
    ///
    /// `prefix` namespaces keys so several projects can share one service.
    pub fn new(
        url: &str,
        prefix: &str,
        token: Option<String>,
        timeout: Duration,
        max_body_bytes: u64,
    ) -> Self {
        let mut base = format!("{}/cacheprog", url.trim_end_matches('/'));
        let prefix = prefix.trim().trim_matches('/');
        if !prefix.is_empty() {
            base.push('/');
            base.push_str(prefix);
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base,
            token,
            max_body_bytes,
        }
    }

    fn body_url(&self, key: &StorageKey) -> String {
        format!("{}/{}-o", self.base, key)
    }

    fn meta_url(&self, key: &StorageKey) -> String {
        format!("{}/{}-i", self.base, key)
    }

    fn client(&self) -> Client {
        Client {
            agent: self.agent.clone(),
            token: self.token.clone(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// The parts of [`HttpRemote`] a blocking call needs
struct Client {
    agent: ureq::Agent,
    token: Option<String>,
    max_body_bytes: u64,
}

impl Client {
    fn fetch(&self, url: &str) -> CacheprogResult<Option<Vec<u8>>> {
        let mut request = self.agent.get(url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let mut response = request
            .call()
            .map_err(|e| CacheprogError::remote(format!("GET {}", url), e))?;

        match response.status().as_u16() {
            200 => {
                let body = response
                    .body_mut()
                    .with_config()
                    .limit(self.max_body_bytes)
                    .read_to_vec()
                    .map_err(|e| CacheprogError::remote(format!("reading {}", url), e))?;
                Ok(Some(body))
            }
            404 => Ok(None),
            status => Err(CacheprogError::remote(
                format!("GET {}", url),
                format!("unexpected status {}", status),
            )),
        }
    }

    fn store(&self, url: &str, data: &[u8]) -> CacheprogResult<()> {
        let mut request = self.agent.put(url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send(data)
            .map_err(|e| CacheprogError::remote(format!("PUT {}", url), e))?;

        if !response.status().is_success() {
            return Err(CacheprogError::remote(
                format!("PUT {}", url),
                format!("unexpected status {}", response.status().as_u16()),
            ));
        }
        Ok(())
    }
}

/// Run a blocking client call off the runtime, giving up when `ctx` is cancelled
async fn blocking<T, F>(ctx: &CancellationToken, what: &str, call: F) -> CacheprogResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CacheprogResult<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(call);
    tokio::select! {
        _ = ctx.cancelled() => Err(CacheprogError::Cancelled),
        joined = task => joined
            .map_err(|e| CacheprogError::Internal(format!("{} task failed: {}", what, e)))?,
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
    ) -> CacheprogResult<Option<RemoteEntry>> {
        if key.is_empty() {
            return Err(CacheprogError::EmptyKey);
        }

        let client = self.client();
        let meta_url = self.meta_url(key);
        let body_url = self.body_url(key);

        blocking(ctx, "remote get", move || {
            let Some(raw_meta) = client.fetch(&meta_url)? else {
                return Ok(None);
            };
            let meta: RemoteMeta = serde_json::from_slice(&raw_meta).map_err(|e| {
                CacheprogError::remote(format!("decoding {}", meta_url), e)
            })?;

            let body = client.fetch(&body_url)?.map(Bytes::from);
            if body.is_none() {
                debug!("Remote metadata {} has no body", meta_url);
            }
            Ok(Some(RemoteEntry { meta, body }))
        })
        .await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &StorageKey,
        body: Bytes,
        meta: RemoteMeta,
    ) -> CacheprogResult<()> {
        if key.is_empty() {
            return Err(CacheprogError::EmptyKey);
        }

        let client = self.client();
        let meta_url = self.meta_url(key);
        let body_url = self.body_url(key);
        let raw_meta = serde_json::to_vec(&meta)?;

        // Body first: metadata without a body reads as a broken entry.
        blocking(ctx, "remote put", move || {
            client.store(&body_url, &body)?;
            client.store(&meta_url, &raw_meta)
        })
        .await
    }

    async fn close(&self, _ctx: &CancellationToken) -> CacheprogResult<()> {
        Ok(())
    }
}
