//! Gapless playback of incoming PCM chunks.
//!
//! [`PlaybackSequencer::play`] decodes a chunk and schedules it on an
//! [`OutputDevice`] strictly in call order.  Every scheduled buffer carries a
//! [`Completion`] token; the device redeems it once the buffer has been
//! consumed.  When the last outstanding buffer completes the sequencer stops
//! the device and publishes [`PlaybackEvent::Complete`] on the channel
//! returned by [`PlaybackSequencer::subscribe`].
//!
//! ```text
//! Idle ──play──▶ Playing ──last completion──▶ Draining ──▶ Idle
//!   ▲               │
//!   └─────stop──────┘   (emits Stopped, never Complete)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;

use super::chunk::{self, DecodeError};
use super::device::{DeviceSetupError, OutputDevice};
use super::format::{AudioFormat, PcmBuffer};

// ---------------------------------------------------------------------------
// PlaybackState / PlaybackEvent / PlaybackError
// ---------------------------------------------------------------------------

/// Phase of the playback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    /// The final buffer finished; the device is being stopped.
    Draining,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Draining,
            _ => PlaybackState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Draining => 2,
        }
    }
}

/// Published to the subscriber when a playback session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Every scheduled buffer played to the end.
    Complete,
    /// [`PlaybackSequencer::stop`] cut playback short.
    Stopped,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("output device unavailable: {0}")]
    Device(#[from] DeviceSetupError),

    #[error("chunk rejected: {0}")]
    Decode(#[from] DecodeError),
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Redeemed by the output device when one scheduled buffer has been played.
///
/// Tokens from a session that was stopped are ignored, so a late callback
/// can never drive the pending count of a newer session.
pub struct Completion {
    shared: Weak<Shared>,
    generation: u64,
}

impl Completion {
    pub fn complete(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finish(self.generation);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("generation", &self.generation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Buffers waiting to be handed to the device, plus the number handed over
/// but not yet played.
struct PlaybackQueue {
    pending: Mutex<VecDeque<PcmBuffer>>,
    scheduled: AtomicUsize,
}

struct Shared {
    device: Arc<dyn OutputDevice>,
    format: AudioFormat,
    queue: PlaybackQueue,
    state: AtomicU8,
    generation: AtomicU64,
    subscriber: Mutex<Option<Sender<PlaybackEvent>>>,
}

impl Shared {
    /// The pending lock serializes play, stop and the final completion.
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<PcmBuffer>> {
        self.queue
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn emit(&self, event: PlaybackEvent) {
        let mut subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(event).is_err() {
                // Receiver gone; stop publishing to it.
                *subscriber = None;
            }
        }
    }

    fn finish(&self, generation: u64) {
        let _pending = self.lock_pending();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let previous = self
            .queue
            .scheduled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous != Ok(1) {
            return;
        }

        self.set_state(PlaybackState::Draining);
        self.device.stop();
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::debug!("playback: last buffer finished");
        self.emit(PlaybackEvent::Complete);
        self.set_state(PlaybackState::Idle);
    }
}

// ---------------------------------------------------------------------------
// PlaybackSequencer
// ---------------------------------------------------------------------------

/// Schedules PCM chunks onto an output device in arrival order.
///
/// All methods take `&self` and may be called from any thread.
pub struct PlaybackSequencer {
    shared: Arc<Shared>,
}

impl PlaybackSequencer {
    /// Sequencer for canonical (44.1 kHz mono 16-bit) chunks.
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self::with_format(device, AudioFormat::canonical())
    }

    /// Sequencer for chunks in `format`.
    pub fn with_format(device: Arc<dyn OutputDevice>, format: AudioFormat) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                format,
                queue: PlaybackQueue {
                    pending: Mutex::new(VecDeque::new()),
                    scheduled: AtomicUsize::new(0),
                },
                state: AtomicU8::new(PlaybackState::Idle.as_u8()),
                generation: AtomicU64::new(0),
                subscriber: Mutex::new(None),
            }),
        }
    }

    /// Receive [`PlaybackEvent`]s.  Replaces any earlier subscription.
    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = mpsc::channel();
        *self
            .shared
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Decode `chunk` and schedule it after everything already scheduled.
    ///
    /// A trailing partial frame is dropped with a warning; the whole frames
    /// still play.
    ///
    /// # Errors
    ///
    /// [`PlaybackError::Device`] when the output device cannot be started,
    /// [`PlaybackError::Decode`] when the sequencer's format cannot hold
    /// 16-bit frames.
    pub fn play(&self, chunk: &[u8]) -> Result<(), PlaybackError> {
        let buffer = match chunk::decode(chunk, self.shared.format) {
            Ok(buffer) => buffer,
            Err(DecodeError::PartialFrame {
                recovered,
                len,
                dropped,
            }) => {
                log::warn!("playback: {len}-byte chunk ends mid-frame, dropped {dropped} byte(s)");
                recovered
            }
            Err(e) => return Err(e.into()),
        };

        let shared = &self.shared;
        let mut pending = shared.lock_pending();
        pending.push_back(buffer);

        if shared.state() == PlaybackState::Idle {
            if let Err(e) = shared.device.start() {
                pending.clear();
                return Err(e.into());
            }
            shared.set_state(PlaybackState::Playing);
            log::debug!("playback: started");
        }

        let generation = shared.generation.load(Ordering::SeqCst);
        while let Some(buffer) = pending.pop_front() {
            shared.queue.scheduled.fetch_add(1, Ordering::SeqCst);
            shared.device.schedule(
                buffer,
                Completion {
                    shared: Arc::downgrade(shared),
                    generation,
                },
            );
        }
        Ok(())
    }

    /// Stop playback immediately and forget every scheduled buffer.
    ///
    /// Emits [`PlaybackEvent::Stopped`] if something was playing; never
    /// emits [`PlaybackEvent::Complete`].
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut pending = shared.lock_pending();
        pending.clear();

        let was = shared.state();
        shared.generation.fetch_add(1, Ordering::SeqCst);
        shared.queue.scheduled.store(0, Ordering::SeqCst);
        shared.device.stop();
        shared.set_state(PlaybackState::Idle);

        if was != PlaybackState::Idle {
            log::debug!("playback: stopped");
            shared.emit(PlaybackEvent::Stopped);
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Buffers scheduled on the device but not yet played.
    pub fn pending(&self) -> usize {
        self.shared.queue.scheduled.load(Ordering::SeqCst)
    }

    /// Format expected of incoming chunks.
    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
