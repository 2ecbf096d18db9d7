//! Outbound transport: one long-lived chunked HTTP upload per broadcast.
//!
//! The server end and any retry policy are out of scope; a failed session is
//! reported once and the caller decides whether to open another.

pub mod uploader;

pub use uploader::{
    StreamSession, StreamingUploader, TransportSetupError, TransportState, TransportWriteError,
};
