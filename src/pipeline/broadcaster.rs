//! Broadcaster: wires microphone capture to the upload and owns playback.
//!
//! One `Broadcaster` per process replaces a global audio helper.  It owns
//! the uploader, a single [`CaptureSession`], a single
//! [`PlaybackSequencer`], and at most one live [`StreamSession`].
//!
//! # Recording flow
//!
//! ```text
//! start_recording()
//!   ├─ upload_url() + auth_token()           (ConfigError)
//!   ├─ StreamingUploader::open  → Streaming  (TransportSetupError)
//!   └─ CaptureSession::start(session)        (CaptureError; session closed)
//!
//! stop_recording()
//!   └─ CaptureSession::stop → device halted → session closed
//! ```
//!
//! Start and stop hold an async transition lock, so a stop issued while a
//! start is still connecting waits for it and then tears it down.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;

use crate::audio::{
    CaptureError, CaptureSession, CpalInput, CpalOutput, DeviceSetupError, FormatConverter,
    InputDevice, OutputDevice, PlaybackError, PlaybackEvent, PlaybackSequencer,
};
use crate::config::{AppConfig, ConfigError};
use crate::stream::{StreamSession, StreamingUploader, TransportSetupError, TransportState};

use super::state::BroadcastStatus;

// ---------------------------------------------------------------------------
// BroadcastError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("already recording")]
    AlreadyRecording,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportSetupError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Device(#[from] DeviceSetupError),
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Application context for recording and playback.
///
/// ```rust,no_run
/// use voice_broadcast::config::AppConfig;
/// use voice_broadcast::pipeline::Broadcaster;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broadcaster = Broadcaster::with_default_devices(AppConfig::load()?)?;
/// broadcaster.start_recording().await?;
/// tokio::signal::ctrl_c().await?;
/// broadcaster.stop_recording().await;
/// # Ok(())
/// # }
/// ```
pub struct Broadcaster {
    config: AppConfig,
    uploader: StreamingUploader,
    capture: CaptureSession,
    playback: PlaybackSequencer,
    session: Mutex<Option<Arc<StreamSession>>>,
    /// Serializes start/stop across the connect await.
    transition: tokio::sync::Mutex<()>,
}

impl Broadcaster {
    /// Build a broadcaster around explicit devices.
    pub fn new(
        config: AppConfig,
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
    ) -> Result<Self, BroadcastError> {
        let converter = FormatConverter::new(config.audio.interpolation);
        let uploader = StreamingUploader::new(&config.upload)?;

        Ok(Self {
            capture: CaptureSession::new(input, converter),
            playback: PlaybackSequencer::new(output),
            uploader,
            session: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// Build a broadcaster on the cpal devices named in `config.audio`
    /// (system defaults when unset).
    pub fn with_default_devices(config: AppConfig) -> Result<Self, BroadcastError> {
        let converter = FormatConverter::new(config.audio.interpolation);
        let input = CpalInput::new(config.audio.input_device.as_deref())?;
        let output = CpalOutput::new(config.audio.output_device.as_deref(), converter)?;
        Self::new(config, Arc::new(input), Arc::new(output))
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Open the upload and start streaming microphone audio into it.
    ///
    /// # Errors
    ///
    /// * [`BroadcastError::AlreadyRecording`] when a recording is active.
    /// * [`BroadcastError::Config`] for a missing broadcast id or token.
    /// * [`BroadcastError::Transport`] when the upload cannot be opened.
    /// * [`BroadcastError::Capture`] when the microphone cannot be opened;
    ///   the upload is closed again.
    pub async fn start_recording(&self) -> Result<(), BroadcastError> {
        let _transition = self.transition.lock().await;
        if self.capture.state().is_active() {
            return Err(BroadcastError::AlreadyRecording);
        }

        let url = self.config.server.upload_url()?;
        let token = self.config.server.auth_token()?;

        let session = self.uploader.open(&url, &token).await?;
        *self.lock_session() = Some(Arc::clone(&session));

        if let Err(e) = self.capture.start(session) {
            log::error!("broadcast: microphone failed, upload closed: {e}");
            return Err(e.into());
        }

        log::info!("broadcast: on air at {url}");
        Ok(())
    }

    /// Stop the microphone, then close the upload.  Idempotent.
    pub async fn stop_recording(&self) {
        let _transition = self.transition.lock().await;
        let was_recording = self.capture.state().is_active();

        self.capture.stop();
        if let Some(session) = self.lock_session().as_ref() {
            session.close();
        }

        if was_recording {
            log::info!("broadcast: off air");
        }
    }

    /// Watch the current upload's state, if one has been opened.
    pub fn transport_changes(&self) -> Option<watch::Receiver<TransportState>> {
        self.lock_session().as_ref().map(|s| s.state_changes())
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// Queue one canonical PCM chunk for playback.
    pub fn play(&self, chunk: &[u8]) -> Result<(), BroadcastError> {
        self.playback.play(chunk)?;
        Ok(())
    }

    pub fn stop_playback(&self) {
        self.playback.stop();
    }

    /// Receive playback events.  Replaces any earlier subscription.
    pub fn subscribe_playback(&self) -> std::sync::mpsc::Receiver<PlaybackEvent> {
        self.playback.subscribe()
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> BroadcastStatus {
        BroadcastStatus {
            capture: self.capture.state(),
            transport: self.lock_session().as_ref().map(|s| s.state()),
            playback: self.playback.state(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Arc<StreamSession>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
