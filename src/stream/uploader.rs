//! Long-lived HTTP chunked upload of raw PCM.
//!
//! [`StreamingUploader::open`] issues one `PUT` whose body is an unbounded
//! stream fed from a bounded queue.  The capture path pushes encoded chunks
//! with [`StreamSession::try_push`], which never waits: when the queue is
//! full the chunk is dropped.  Losing a few milliseconds of audio is
//! preferable to stalling the audio thread or buffering without limit.
//!
//! ```text
//! capture thread ──try_push──▶ [bounded queue] ──body stream──▶ reqwest ──▶ server
//!                                   ▲
//!           keep-alive task ─filler─┘  (once, only if no audio yet)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, TRANSFER_ENCODING};
use reqwest::{Body, Client, RequestBuilder, Url};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::ChunkSink;
use crate::config::UploadConfig;

// ---------------------------------------------------------------------------
// TransportState
// ---------------------------------------------------------------------------

/// Lifecycle of one upload.  `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Closed,
    Failed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Closed | TransportState::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransportState::Idle => "Idle",
            TransportState::Connecting => "Connecting",
            TransportState::Streaming => "Streaming",
            TransportState::Closed => "Closed",
            TransportState::Failed => "Failed",
        }
    }
}

/// Move to `next` unless the current state is terminal.
fn advance(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The upload could not be established.  Fatal to the session.
#[derive(Debug, Error)]
pub enum TransportSetupError {
    #[error("invalid upload URL {0}")]
    InvalidUrl(String),

    #[error("upload URL must use http or https, got {0:?}")]
    UnsupportedScheme(String),

    #[error("auth token is empty")]
    MissingToken,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to open upload to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timed out after {0:?} connecting to {1}")]
    Timeout(Duration, String),

    #[error("no async runtime: {0}")]
    NoRuntime(String),
}

/// A single chunk could not be queued.  Recoverable: the chunk is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportWriteError {
    #[error("transport not ready, dropped {0} byte(s)")]
    Full(usize),

    #[error("transport closed, dropped {0} byte(s)")]
    Closed(usize),
}

// ---------------------------------------------------------------------------
// StreamingUploader
// ---------------------------------------------------------------------------

/// Opens [`StreamSession`]s.  Holds one pooled HTTP/1.1 client.
pub struct StreamingUploader {
    client: Client,
    config: UploadConfig,
}

impl StreamingUploader {
    /// Build the HTTP client.  Chunked transfer only exists in HTTP/1.1, so
    /// the client never negotiates HTTP/2.
    pub fn new(config: &UploadConfig) -> Result<Self, TransportSetupError> {
        let client = Client::builder()
            .http1_only()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(TransportSetupError::Client)?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Start a chunked `PUT` to `url`, wait until the transport begins
    /// pulling the body, then give the server the reject window to refuse
    /// the upload.
    ///
    /// # Errors
    ///
    /// [`TransportSetupError`] for a malformed URL, an empty token, a refused
    /// connection, a server response within the reject window, or no
    /// progress within the connect timeout.
    pub async fn open(
        &self,
        url: &str,
        auth_token: &str,
    ) -> Result<Arc<StreamSession>, TransportSetupError> {
        let destination =
            Url::parse(url).map_err(|e| TransportSetupError::InvalidUrl(format!("{url:?}: {e}")))?;
        if !matches!(destination.scheme(), "http" | "https") {
            return Err(TransportSetupError::UnsupportedScheme(
                destination.scheme().to_owned(),
            ));
        }
        if auth_token.trim().is_empty() {
            return Err(TransportSetupError::MissingToken);
        }
        let runtime =
            Handle::try_current().map_err(|e| TransportSetupError::NoRuntime(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(self.config.queue_depth.max(1));
        let state = Arc::new(watch::channel(TransportState::Idle).0);
        let mut state_rx = state.subscribe();
        let last_error = Arc::new(Mutex::new(None));

        let request = self
            .client
            .put(destination.clone())
            .bearer_auth(auth_token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(TRANSFER_ENCODING, "chunked")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::wrap_stream(body_stream(rx, Arc::clone(&state))));

        advance(&state, TransportState::Connecting);
        log::info!("upload: connecting to {destination}");
        let task = runtime.spawn(run_request(
            request,
            Arc::clone(&state),
            Arc::clone(&last_error),
        ));

        let session = Arc::new(StreamSession {
            destination,
            auth_token: auth_token.to_owned(),
            state,
            outbox: Mutex::new(Some(tx)),
            has_data: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            bytes_queued: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            request: Mutex::new(Some(task)),
            keepalive: Mutex::new(None),
            runtime,
            close_grace: self.config.close_grace(),
        });

        let timeout = self.config.connect_timeout();
        let reached = match tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| *s != TransportState::Connecting),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => Some(TransportState::Failed),
            Err(_) => None,
        };

        match reached {
            Some(TransportState::Streaming) => {}
            Some(_) => return Err(open_failed(&session, url, &last_error)),
            None => {
                session.abort();
                return Err(TransportSetupError::Timeout(timeout, url.to_owned()));
            }
        }
        session.spawn_keepalive(self.config.keepalive_delay(), self.config.filler_bytes);

        // hyper pulls the body as soon as the head is written, so an auth
        // rejection only shows up after `Streaming`.
        let window = self.config.reject_window();
        if !window.is_zero() {
            let ended = tokio::time::timeout(window, state_rx.wait_for(TransportState::is_terminal))
                .await
                .is_ok_and(|waited| waited.is_ok());
            if ended {
                return Err(open_failed(&session, url, &last_error));
            }
        }

        log::info!("upload: streaming to {}", session.destination);
        Ok(session)
    }
}

fn open_failed(
    session: &StreamSession,
    url: &str,
    last_error: &Mutex<Option<String>>,
) -> TransportSetupError {
    session.abort();
    let reason = last_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_else(|| "server ended the upload before streaming".into());
    TransportSetupError::Connect {
        url: url.to_owned(),
        reason,
    }
}

/// Request body: chunks from the queue until every sender is gone.
///
/// The first poll means hyper has connected and written the request head,
/// which is what moves the session to `Streaming`.
fn body_stream(
    rx: mpsc::Receiver<Bytes>,
    state: Arc<watch::Sender<TransportState>>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    stream::unfold((rx, state, false), |(mut rx, state, announced)| async move {
        if !announced {
            advance(&state, TransportState::Streaming);
        }
        let chunk = rx.recv().await?;
        Some((Ok(chunk), (rx, state, true)))
    })
}

async fn run_request(
    request: RequestBuilder,
    state: Arc<watch::Sender<TransportState>>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let failure = match request.send().await {
        Ok(response) if response.status().is_success() => {
            log::info!("upload: server finished with {}", response.status());
            advance(&state, TransportState::Closed);
            return;
        }
        Ok(response) => format!("server responded {}", response.status()),
        Err(e) => e.to_string(),
    };

    log::error!("upload: {failure}");
    *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
    advance(&state, TransportState::Failed);
}

// ---------------------------------------------------------------------------
// StreamSession
// ---------------------------------------------------------------------------

/// One outbound upload.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and may be
/// called from any thread, including the audio thread.
pub struct StreamSession {
    destination: Url,
    auth_token: String,
    state: Arc<watch::Sender<TransportState>>,
    /// `None` once closed.  Writes and close are serialized by this lock.
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    has_data: AtomicBool,
    dropping: AtomicBool,
    bytes_queued: AtomicU64,
    bytes_dropped: AtomicU64,
    request: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    close_grace: Duration,
}

impl StreamSession {
    /// Queue `bytes` without waiting.
    ///
    /// # Errors
    ///
    /// [`TransportWriteError::Full`] when the transport has not drained the
    /// queue, [`TransportWriteError::Closed`] after close or failure.  The
    /// chunk is dropped in both cases.
    pub fn try_push(&self, bytes: Bytes) -> Result<(), TransportWriteError> {
        self.has_data.store(true, Ordering::SeqCst);
        self.enqueue(bytes)
    }

    fn enqueue(&self, bytes: Bytes) -> Result<(), TransportWriteError> {
        let len = bytes.len();
        let result = {
            let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            match outbox.as_ref() {
                Some(_) if self.state().is_terminal() => Err(TransportWriteError::Closed(len)),
                Some(tx) => tx.try_send(bytes).map_err(|e| match e {
                    TrySendError::Full(b) => TransportWriteError::Full(b.len()),
                    TrySendError::Closed(b) => TransportWriteError::Closed(b.len()),
                }),
                None => Err(TransportWriteError::Closed(len)),
            }
        };

        match result {
            Ok(()) => {
                self.bytes_queued.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.bytes_dropped.fetch_add(len as u64, Ordering::Relaxed);
            }
        }
        result
    }

    /// Finish the upload: end the body, cancel the keep-alive, and give the
    /// request `close_grace` to complete before cancelling it.  Idempotent.
    pub fn close(&self) {
        let outbox = self
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if outbox.is_none() {
            return;
        }
        // Dropping the last sender ends the body with the chunked terminator.
        drop(outbox);

        if let Some(keepalive) = self.take_keepalive() {
            keepalive.abort();
        }
        advance(&self.state, TransportState::Closed);

        let request = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(request) = request {
            let grace = self.close_grace;
            let abort = request.abort_handle();
            self.runtime.spawn(async move {
                if tokio::time::timeout(grace, request).await.is_err() {
                    abort.abort();
                    log::debug!("upload: request cancelled after {grace:?}");
                }
            });
        }

        log::info!(
            "upload: closed {} ({} bytes queued, {} dropped)",
            self.destination,
            self.bytes_queued(),
            self.bytes_dropped()
        );
    }

    /// Tear down immediately after a failed open.
    fn abort(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keepalive) = self.take_keepalive() {
            keepalive.abort();
        }
        if let Some(request) = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            request.abort();
        }
        advance(&self.state, TransportState::Failed);
    }

    fn spawn_keepalive(self: &Arc<Self>, delay: Duration, filler_bytes: usize) {
        if filler_bytes == 0 {
            return;
        }
        let session = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.has_data.load(Ordering::SeqCst) {
                return;
            }
            match session.enqueue(Bytes::from(vec![0_u8; filler_bytes])) {
                Ok(()) => log::debug!("upload: sent {filler_bytes}-byte keep-alive filler"),
                Err(e) => log::warn!("upload: keep-alive filler not sent: {e}"),
            }
        });
        *self.keepalive.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn take_keepalive(&self) -> Option<JoinHandle<()>> {
        self.keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Wait until `done` accepts the state or `timeout` passes.  Returns the
    /// accepted state, or `None` on timeout.
    pub async fn wait_for_state(
        &self,
        done: impl FnMut(&TransportState) -> bool,
        timeout: Duration,
    ) -> Option<TransportState> {
        let mut changes = self.state.subscribe();
        // Bound before returning: the `Ref` temporary borrows `changes`.
        let reached = match tokio::time::timeout(timeout, changes.wait_for(done)).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) | Err(_) => None,
        };
        reached
    }

    pub fn destination(&self) -> &Url {
        &self.destination
    }

    /// Bytes accepted into the queue, filler included.
    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued.load(Ordering::Relaxed)
    }

    /// Bytes rejected because the queue was full or closed.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(Self {
            destination: Url::parse("http://localhost/detached").expect("static url"),
            auth_token: "test-token".into(),
            state: Arc::new(watch::channel(TransportState::Streaming).0),
            outbox: Mutex::new(Some(tx)),
            has_data: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            bytes_queued: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            request: Mutex::new(None),
            keepalive: Mutex::new(None),
            runtime: Handle::current(),
            close_grace: Duration::from_millis(10),
        });
        (session, rx)
    }
}

impl ChunkSink for StreamSession {
    /// Best effort: failures are logged and the chunk is dropped.
    fn push(&self, bytes: Bytes) {
        match self.try_push(bytes) {
            Ok(()) => {
                if self.dropping.swap(false, Ordering::Relaxed) {
                    log::info!("upload: transport caught up");
                }
            }
            // Only the first drop of a run is a warning.
            Err(e) => {
                if self.dropping.swap(true, Ordering::Relaxed) {
                    log::debug!("upload: {e}");
                } else {
                    log::warn!("upload: {e}");
                }
            }
        }
    }

    fn close(&self) {
        StreamSession::close(self);
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.auth_token.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("StreamSession")
            .field("destination", &self.destination.as_str())
            .field("auth_token", &token)
            .field("state", &self.state())
            .field("bytes_queued", &self.bytes_queued())
            .field("bytes_dropped", &self.bytes_dropped())
            .finish()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
