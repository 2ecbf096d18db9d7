//! Audio: capture, canonical PCM, and ordered playback.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → PcmBuffer (native) → FormatConverter
//!           → PcmBuffer (44.1 kHz mono i16) → chunk::encode → ChunkSink
//!
//! bytes → chunk::decode → PlaybackSequencer → OutputDevice → Completion
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_broadcast::audio::{CaptureSession, ChunkSink, CpalInput, FormatConverter};
//!
//! struct Print;
//! impl ChunkSink for Print {
//!     fn push(&self, bytes: bytes::Bytes) {
//!         println!("{} bytes of canonical PCM", bytes.len());
//!     }
//!     fn close(&self) {}
//! }
//!
//! let input = Arc::new(CpalInput::new(None).unwrap());
//! let session = CaptureSession::new(input, FormatConverter::default());
//! session.start(Arc::new(Print)).unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! session.stop();
//! ```

pub mod capture;
pub mod chunk;
pub mod convert;
pub mod device;
pub mod format;
pub mod playback;

pub use capture::{CaptureError, CaptureSession, CaptureState, ChunkSink};
pub use chunk::DecodeError;
pub use convert::{ConversionError, FormatConverter, Interpolation, StreamConverter};
pub use device::{
    list_devices, ActiveStream, BufferCallback, CpalInput, CpalOutput, DeviceList,
    DeviceSetupError, DeviceThread, InputDevice, OutputDevice,
};
pub use format::{
    AudioFormat, PcmBuffer, SampleEncoding, BYTES_PER_SAMPLE, CANONICAL_CHANNELS,
    CANONICAL_SAMPLE_RATE,
};
pub use playback::{Completion, PlaybackError, PlaybackEvent, PlaybackSequencer, PlaybackState};
