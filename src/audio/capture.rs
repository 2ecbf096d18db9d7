//! Microphone capture session.
//!
//! [`CaptureSession`] drives an [`InputDevice`] and pushes every captured
//! buffer through
//!
//! ```text
//! device callback → StreamConverter → chunk::encode → ChunkSink::push
//! ```
//!
//! synchronously on the device's audio thread, so chunks reach the sink in
//! capture order.  One converter spans the whole run; `stop` flushes its
//! tail into the sink before closing it.  The session is a small state machine:
//!
//! ```text
//! Idle ──start──▶ Configuring ──device open──▶ Running ──stop──▶ Stopped
//!                     │                                            │
//!                     └──device error──▶ Idle        start ◀───────┘
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;

use super::chunk;
use super::convert::{FormatConverter, StreamConverter};
use super::device::{ActiveStream, DeviceSetupError, InputDevice};
use super::format::{AudioFormat, PcmBuffer};

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// Destination of encoded capture chunks.
///
/// `push` is called from the audio thread and must never block for long or
/// panic; implementations drop data they cannot accept.
pub trait ChunkSink: Send + Sync {
    fn push(&self, bytes: Bytes);

    /// Release the sink.  Called once, after the last `push`.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// CaptureState / CaptureError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    /// The input device and sink are being wired up.
    Configuring,
    /// Buffers are flowing to the sink.
    Running,
    Stopped,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Configuring,
            2 => CaptureState::Running,
            3 => CaptureState::Stopped,
            _ => CaptureState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CaptureState::Idle => 0,
            CaptureState::Configuring => 1,
            CaptureState::Running => 2,
            CaptureState::Stopped => 3,
        }
    }

    /// `true` while a start is in progress or audio is flowing.
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureState::Configuring | CaptureState::Running)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture session is already active")]
    AlreadyActive,

    #[error("input device setup failed: {0}")]
    DeviceSetup(#[from] DeviceSetupError),

    #[error("capture was stopped while it was being configured")]
    Interrupted,
}

// ---------------------------------------------------------------------------
// Shared state (reachable from the audio callback)
// ---------------------------------------------------------------------------

struct CaptureShared {
    state: AtomicU8,
    /// Held for every conversion and push and for the stop transition, so a
    /// push can never land on a closed sink.  Locked before `converter`.
    sink: Mutex<Option<Arc<dyn ChunkSink>>>,
    converter: Mutex<StreamConverter>,
    target: AudioFormat,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureShared {
    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Runs on the audio thread.  Never panics, never propagates.
    fn deliver(&self, buffer: PcmBuffer) {
        if self.state() != CaptureState::Running {
            return;
        }

        let Ok(guard) = self.sink.lock() else {
            return;
        };
        let Some(sink) = guard.as_ref() else {
            return;
        };

        let converted = self.lock_converter().process(buffer);
        match converted {
            Ok(converted) => self.push(&**sink, converted),
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: dropping buffer: {e}");
            }
        }
    }

    fn push(&self, sink: &dyn ChunkSink, converted: PcmBuffer) {
        if converted.is_empty() {
            return;
        }
        sink.push(chunk::encode(converted));
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_converter(&self) -> MutexGuard<'_, StreamConverter> {
        self.converter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Push the converter's tail, then close the sink.
    fn finish_sink(&self) {
        let mut guard = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = guard.take() else {
            return;
        };
        let tail = self.lock_converter().flush();
        match tail {
            Ok(tail) => self.push(&*sink, tail),
            Err(e) => log::warn!("capture: dropping converter tail: {e}"),
        }
        drop(guard);
        sink.close();
    }

    fn take_sink(&self) -> Option<Arc<dyn ChunkSink>> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

/// Streams converted, encoded microphone audio into a [`ChunkSink`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use voice_broadcast::audio::{CaptureSession, CpalInput, FormatConverter};
/// # fn sink() -> Arc<dyn voice_broadcast::audio::ChunkSink> { unimplemented!() }
///
/// let input = Arc::new(CpalInput::new(None).unwrap());
/// let session = CaptureSession::new(input, FormatConverter::default());
/// session.start(sink()).unwrap();
/// // ...
/// session.stop();
/// ```
pub struct CaptureSession {
    shared: Arc<CaptureShared>,
    input: Arc<dyn InputDevice>,
    stream: Mutex<Option<Box<dyn ActiveStream>>>,
}

impl CaptureSession {
    /// Session converting to the canonical wire format.
    pub fn new(input: Arc<dyn InputDevice>, converter: FormatConverter) -> Self {
        Self::with_target(input, converter, AudioFormat::canonical())
    }

    /// Session converting to `target`.
    pub fn with_target(
        input: Arc<dyn InputDevice>,
        converter: FormatConverter,
        target: AudioFormat,
    ) -> Self {
        Self {
            shared: Arc::new(CaptureShared {
                state: AtomicU8::new(CaptureState::Idle.as_u8()),
                sink: Mutex::new(None),
                converter: Mutex::new(converter.stream(target)),
                target,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            input,
            stream: Mutex::new(None),
        }
    }

    /// Open the input device and start feeding `sink`.
    ///
    /// On failure the sink is closed and the session returns to `Idle`.
    ///
    /// # Errors
    ///
    /// * [`CaptureError::AlreadyActive`] when configuring or running.
    /// * [`CaptureError::DeviceSetup`] when the device cannot be opened.
    /// * [`CaptureError::Interrupted`] when [`stop`](Self::stop) ran while the
    ///   device was opening.
    pub fn start(&self, sink: Arc<dyn ChunkSink>) -> Result<(), CaptureError> {
        let shared = &self.shared;
        if !shared.transition(CaptureState::Idle, CaptureState::Configuring)
            && !shared.transition(CaptureState::Stopped, CaptureState::Configuring)
        {
            return Err(CaptureError::AlreadyActive);
        }

        // A start that raced a stop may have left its sink behind.
        if let Some(stale) = shared.take_sink() {
            stale.close();
        }
        shared.lock_converter().reset();
        *shared.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);

        let callback_shared = Arc::clone(shared);
        let mut stream = match self
            .input
            .open(Box::new(move |buffer| callback_shared.deliver(buffer)))
        {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(sink) = shared.take_sink() {
                    sink.close();
                }
                shared.transition(CaptureState::Configuring, CaptureState::Idle);
                log::error!("capture: {e}");
                return Err(e.into());
            }
        };

        if !shared.transition(CaptureState::Configuring, CaptureState::Running) {
            stream.stop();
            if let Some(sink) = shared.take_sink() {
                sink.close();
            }
            return Err(CaptureError::Interrupted);
        }

        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        log::info!(
            "capture: running ({:?} → {:?})",
            self.input.format(),
            shared.target
        );
        Ok(())
    }

    /// Stop the device and close the sink.  Safe to call at any time, from
    /// any thread, any number of times.
    pub fn stop(&self) {
        let shared = &self.shared;
        let previous = shared.state();
        if !previous.is_active() {
            return;
        }
        if !shared.transition(previous, CaptureState::Stopped) {
            // Raced with another transition; whoever won handles teardown.
            return;
        }

        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut stream) = stream {
            stream.stop();
        }

        // A running configuration closes its own sink on `Interrupted`.
        if previous == CaptureState::Running {
            shared.finish_sink();
        }
        log::info!(
            "capture: stopped ({} chunk(s) sent, {} dropped)",
            self.buffers_delivered(),
            self.buffers_dropped()
        );
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    /// Chunks handed to the sink since the session was created.
    pub fn buffers_delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Buffers discarded because they could not be converted.
    pub fn buffers_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
