//! Broadcast status snapshot.
//!
//! [`BroadcastStatus`] is a point-in-time copy of the three state machines
//! a [`Broadcaster`](super::Broadcaster) owns.  A front end polls it instead
//! of keeping its own "is recording" / "is playing" flags.
//! [`BroadcastPhase`] folds it into the one word a status line needs.

use crate::audio::{CaptureState, PlaybackState};
use crate::stream::TransportState;

// ---------------------------------------------------------------------------
// BroadcastPhase
// ---------------------------------------------------------------------------

/// Coarse phase derived from a [`BroadcastStatus`].
///
/// ```text
/// Idle ──start_recording──▶ Connecting ──upload streaming──▶ Broadcasting
///      ──play──▶ Playing ──Complete / stop_playback──▶ Idle
/// Broadcasting ──upload failed──▶ Error ──stop_recording──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPhase {
    #[default]
    Idle,

    /// The upload is being opened or the microphone is being configured.
    Connecting,

    /// Microphone audio is flowing to the server.
    Broadcasting,

    /// Received audio is playing and nothing is being recorded.
    Playing,

    /// The upload failed while the microphone was still open.
    Error,
}

impl BroadcastPhase {
    /// Returns `true` while recording or playback holds an audio device.
    ///
    /// ```
    /// use voice_broadcast::pipeline::BroadcastPhase;
    ///
    /// assert!(!BroadcastPhase::Idle.is_busy());
    /// assert!(BroadcastPhase::Connecting.is_busy());
    /// assert!(BroadcastPhase::Broadcasting.is_busy());
    /// assert!(BroadcastPhase::Playing.is_busy());
    /// assert!(!BroadcastPhase::Error.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            BroadcastPhase::Connecting | BroadcastPhase::Broadcasting | BroadcastPhase::Playing
        )
    }

    /// A short human-readable label suitable for a status line.
    pub fn label(&self) -> &'static str {
        match self {
            BroadcastPhase::Idle => "Idle",
            BroadcastPhase::Connecting => "Connecting",
            BroadcastPhase::Broadcasting => "On air",
            BroadcastPhase::Playing => "Playing",
            BroadcastPhase::Error => "Error",
        }
    }
}

// ---------------------------------------------------------------------------
// BroadcastStatus
// ---------------------------------------------------------------------------

/// Snapshot of capture, upload and playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastStatus {
    pub capture: CaptureState,
    /// `None` when no upload has been opened yet.
    pub transport: Option<TransportState>,
    pub playback: PlaybackState,
}

impl BroadcastStatus {
    pub fn phase(&self) -> BroadcastPhase {
        let recording = self.capture.is_active();
        match (self.capture, self.transport) {
            (_, Some(TransportState::Failed)) if recording => BroadcastPhase::Error,
            (CaptureState::Configuring, _) | (_, Some(TransportState::Connecting)) => {
                BroadcastPhase::Connecting
            }
            (CaptureState::Running, _) => BroadcastPhase::Broadcasting,
            _ if self.playback != PlaybackState::Idle => BroadcastPhase::Playing,
            _ => BroadcastPhase::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_active()
    }

    pub fn is_playing(&self) -> bool {
        self.playback != PlaybackState::Idle
    }

    pub fn label(&self) -> &'static str {
        self.phase().label()
    }

    pub fn is_busy(&self) -> bool {
        self.phase().is_busy()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
