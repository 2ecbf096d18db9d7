//! Broadcast orchestration.
//!
//! This module wires capture → upload and owns playback, and exposes the
//! status snapshot a front end polls.
//!
//! # Architecture
//!
//! ```text
//! Broadcaster
//!   ├─ StreamingUploader ──open──▶ StreamSession (chunked PUT)
//!   ├─ CaptureSession ──ChunkSink::push──▶ StreamSession
//!   └─ PlaybackSequencer ──schedule──▶ OutputDevice ──Completion──▶ events
//!
//! status() ──▶ BroadcastStatus { capture, transport, playback }
//! ```

pub mod broadcaster;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use broadcaster::{BroadcastError, Broadcaster};
pub use state::{BroadcastPhase, BroadcastStatus};
