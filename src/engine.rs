//! Protocol engine
//!
//! Drives one session over a pair of byte streams:
//!
//! | State | Entered when |
//! |-------|--------------|
//! | Initialized | engine constructed |
//! | Running | handshake written |
//! | Draining | close received or input ended |
//! | Terminated | store chain closed |
//!
//! A single reader decodes requests in order. Each get and put runs as its
//! own task in a join set and writes its response when done, so responses
//! may come back in any order; the `ID` pairs them with requests. There is
//! no cap on outstanding tasks. Close waits for every task, closes the store
//! chain, then answers.
//!
//! Malformed input cannot be resynchronized, so it ends the session with a
//! [`FatalError`] instead of a response.

use crate::error::CacheprogError;
use crate::protocol::{encoding, Command, Request, Response};
use crate::storage::{PutRequest, Storage, StorageKey};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Errors that end the session without a response
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("malformed request on line {line}: {source}")]
    Framing {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed body frame for request {id} on line {line}: {source}")]
    BodyFrame {
        id: i64,
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("input ended before the body frame of request {id}")]
    TruncatedBody { id: i64 },

    #[error("reading input: {0}")]
    Input(#[source] std::io::Error),

    #[error("writing output: {0}")]
    Output(#[source] std::io::Error),
}

/// Lifecycle of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Initialized,
    Running,
    Draining,
    Terminated,
}

/// How a session that did not hit a fatal error ended
#[derive(Debug)]
pub struct Shutdown {
    /// The peer sent close (as opposed to the input simply ending)
    pub close_requested: bool,
    /// Requests read, including close
    pub requests: u64,
    /// Error from closing the store chain, also reported in the close response
    pub close_error: Option<CacheprogError>,
}

/// Line writer shared by all request tasks
///
/// Each response is written and flushed under one lock, so lines from
/// concurrent tasks never interleave.
pub struct ResponseSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> ResponseSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write one response line
    pub async fn send(&self, response: &Response) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(response)?;
        trace!("< {}", String::from_utf8_lossy(&line));
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

/// Serves the cache protocol for one session
pub struct Engine<W> {
    storage: Arc<dyn Storage>,
    sink: Arc<ResponseSink<W>>,
    tasks: JoinSet<()>,
    ctx: CancellationToken,
    state: EngineState,
    line: u64,
    requests: u64,
}

impl<W> Engine<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create an engine answering on `output` from `storage`
    pub fn new(storage: Arc<dyn Storage>, output: W) -> Self {
        Self {
            storage,
            sink: Arc::new(ResponseSink::new(output)),
            tasks: JoinSet::new(),
            ctx: CancellationToken::new(),
            state: EngineState::Initialized,
            line: 0,
            requests: 0,
        }
    }

    /// Token passed to every store call; cancelled when the session dies
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.clone()
    }

    /// Run the session to completion
    ///
    /// Returns once close has been answered or the input has ended. On a
    /// fatal error, outstanding store calls are cancelled and no further
    /// responses are written.
    pub async fn run<R>(mut self, input: R) -> Result<Shutdown, FatalError>
    where
        R: AsyncRead + Unpin,
    {
        let outcome = self.serve(input).await;
        if let Err(e) = &outcome {
            error!("Session aborted: {}", e);
            self.ctx.cancel();
            self.tasks.abort_all();
            self.transition(EngineState::Terminated);
        }
        outcome
    }

    async fn serve<R>(&mut self, input: R) -> Result<Shutdown, FatalError>
    where
        R: AsyncRead + Unpin,
    {
        self.sink
            .send(&Response::handshake())
            .await
            .map_err(FatalError::Output)?;
        self.transition(EngineState::Running);

        let mut lines = BufReader::new(input).lines();
        while let Some(request) = self.next_request(&mut lines).await? {
            self.requests += 1;
            match request.command.clone() {
                Command::Get => self.dispatch_get(request),
                Command::Put => {
                    // The body frame belongs to this request; read it before the next one.
                    let body = if request.body_size > 0 {
                        self.read_body_frame(&mut lines, request.id).await?
                    } else {
                        Vec::new()
                    };
                    self.dispatch_put(request, body);
                }
                Command::Close => return self.shutdown(Some(request.id)).await,
                Command::Unknown(name) => {
                    let id = request.id;
                    self.spawn_response(id, async move {
                        Err(CacheprogError::UnknownCommand(name))
                    });
                }
            }
        }

        debug!("Input ended without close");
        self.shutdown(None).await
    }

    /// Next non-blank line, or `None` at end of input
    async fn next_line<R>(&mut self, lines: &mut Lines<BufReader<R>>) -> Result<Option<String>, FatalError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let Some(line) = lines.next_line().await.map_err(FatalError::Input)? else {
                return Ok(None);
            };
            self.line += 1;
            if !line.trim().is_empty() {
                trace!("> {}", line);
                return Ok(Some(line));
            }
        }
    }

    async fn next_request<R>(
        &mut self,
        lines: &mut Lines<BufReader<R>>,
    ) -> Result<Option<Request>, FatalError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(line) = self.next_line(lines).await? else {
            return Ok(None);
        };
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|source| FatalError::Framing {
                line: self.line,
                source,
            })
    }

    async fn read_body_frame<R>(
        &mut self,
        lines: &mut Lines<BufReader<R>>,
        id: i64,
    ) -> Result<Vec<u8>, FatalError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(line) = self.next_line(lines).await? else {
            return Err(FatalError::TruncatedBody { id });
        };
        encoding::decode_body_frame(&line).map_err(|source| FatalError::BodyFrame {
            id,
            line: self.line,
            source,
        })
    }

    fn dispatch_get(&mut self, request: Request) {
        let storage = self.storage.clone();
        let ctx = self.ctx.clone();
        let id = request.id;

        self.spawn_response(id, async move {
            let key = StorageKey::from_action_id(&request.action_id);
            let Some(entry) = storage.get(&ctx, &key).await? else {
                return Ok(Response::miss(id));
            };
            Ok(Response {
                output_id: entry.output_id,
                disk_path: entry.disk_path.map(|path| path.display().to_string()),
                size: i64::try_from(entry.body_size).unwrap_or(i64::MAX),
                time: entry.stored_at,
                ..Response::answering(id)
            })
        });
    }

    fn dispatch_put(&mut self, request: Request, body: Vec<u8>) {
        let storage = self.storage.clone();
        let ctx = self.ctx.clone();
        let id = request.id;

        self.spawn_response(id, async move {
            let body_size = u64::try_from(request.body_size)
                .map_err(|_| CacheprogError::InvalidBodySize(request.body_size))?;
            let put = PutRequest {
                key: StorageKey::from_action_id(&request.action_id),
                output_id: request.output_id,
                body: Box::new(std::io::Cursor::new(body)),
                body_size,
            };
            let disk_path = storage.put(&ctx, put).await?;
            Ok(Response {
                disk_path: disk_path.map(|path| path.display().to_string()),
                ..Response::answering(id)
            })
        });
    }

    /// Run `handler` as its own task and write whatever it produces as the
    /// response to request `id`
    fn spawn_response<F>(&mut self, id: i64, handler: F)
    where
        F: Future<Output = Result<Response, CacheprogError>> + Send + 'static,
    {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }

        let sink = self.sink.clone();
        self.tasks.spawn(async move {
            let response = match AssertUnwindSafe(handler).catch_unwind().await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => Response::failed(id, e),
                Err(_) => Response::failed(id, "internal error: request handler panicked"),
            };
            if let Err(e) = sink.send(&response).await {
                error!("Failed to write response {}: {}", id, e);
            }
        });
    }

    async fn shutdown(&mut self, close_id: Option<i64>) -> Result<Shutdown, FatalError> {
        self.transition(EngineState::Draining);
        if !self.tasks.is_empty() {
            debug!("Waiting for {} outstanding requests", self.tasks.len());
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }

        let close_result = self.storage.close(&self.ctx).await;
        if let Err(e) = &close_result {
            warn!("Closing storage failed: {}", e);
        }

        if let Some(id) = close_id {
            let response = match &close_result {
                Ok(()) => Response::answering(id),
                Err(e) => Response::failed(id, e),
            };
            self.sink.send(&response).await.map_err(FatalError::Output)?;
        }

        self.transition(EngineState::Terminated);
        info!("Session finished after {} requests", self.requests);
        Ok(Shutdown {
            close_requested: close_id.is_some(),
            requests: self.requests,
            close_error: close_result.err(),
        })
    }

    fn transition(&mut self, next: EngineState) {
        debug_assert!(next >= self.state, "engine moved from {:?} back to {:?}", self.state, next);
        debug!("Engine {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
