//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppPaths;
use crate::audio::Interpolation;

/// Environment variable that overrides [`ServerConfig::auth_token`].
pub const TOKEN_ENV_VAR: &str = "VOICE_BROADCAST_TOKEN";

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Settings that are present but unusable for a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server URL is empty")]
    MissingServerUrl,

    #[error("broadcast id is empty")]
    MissingBroadcastId,

    #[error("broadcast id {0:?} must be a single path segment")]
    InvalidBroadcastId(String),

    #[error("no auth token configured (set server.auth_token or {TOKEN_ENV_VAR})")]
    MissingToken,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Where uploads go and how they authenticate.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the ingest server, without the broadcast id.
    pub server_url: String,
    /// Appended to `server_url` as the last path segment.
    pub broadcast_id: String,
    /// Bearer token.  Never defaulted; `VOICE_BROADCAST_TOKEN` wins when set.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            broadcast_id: String::new(),
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// `<server_url>/<broadcast_id>`.
    pub fn upload_url(&self) -> Result<String, ConfigError> {
        let base = self.server_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        let id = self.broadcast_id.trim();
        if id.is_empty() {
            return Err(ConfigError::MissingBroadcastId);
        }
        if id.contains(['/', '?', '#']) {
            return Err(ConfigError::InvalidBroadcastId(id.to_owned()));
        }
        Ok(format!("{base}/{id}"))
    }

    /// The token to send, from the environment or the settings file.
    pub fn auth_token(&self) -> Result<String, ConfigError> {
        let from_env = std::env::var(TOKEN_ENV_VAR).ok();
        pick_token(from_env.as_deref(), self.auth_token.as_deref())
    }
}

fn pick_token(from_env: Option<&str>, configured: Option<&str>) -> Result<String, ConfigError> {
    [from_env, configured]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_owned)
        .ok_or(ConfigError::MissingToken)
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_url", &self.server_url)
            .field("broadcast_id", &self.broadcast_id)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UploadConfig
// ---------------------------------------------------------------------------

/// Tuning for the chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Chunks buffered between the audio thread and the socket.  A full
    /// queue drops new chunks.
    pub queue_depth: usize,
    /// Wait this long for audio before sending the keep-alive filler.
    pub keepalive_delay_ms: u64,
    /// Size of the zero-filled keep-alive chunk; `0` disables it.
    pub filler_bytes: usize,
    /// Give up on opening the upload after this many seconds.
    pub connect_timeout_secs: u64,
    /// After close, let the request finish for this long before cancelling.
    pub close_grace_ms: u64,
    /// After the body starts flowing, wait this long for the server to
    /// reject the upload before `open` succeeds.  `0` skips the wait.
    pub reject_window_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            keepalive_delay_ms: 100,
            filler_bytes: 4096,
            connect_timeout_secs: 10,
            close_grace_ms: 500,
            reject_window_ms: 200,
        }
    }
}

impl UploadConfig {
    pub fn keepalive_delay(&self) -> Duration {
        Duration::from_millis(self.keepalive_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn reject_window(&self) -> Duration {
        Duration::from_millis(self.reject_window_ms)
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Device selection and conversion quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name; `None` means the system default.
    pub input_device: Option<String>,
    /// Output device name; `None` means the system default.
    pub output_device: Option<String>,
    /// Resampler interpolation used for capture and playback.
    pub interpolation: Interpolation,
    /// Bytes per `play` call when feeding a file (8820 = 100 ms canonical).
    pub playback_chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            interpolation: Interpolation::default(),
            playback_chunk_bytes: 8820,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_broadcast::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// so callers never need to special-case a missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
