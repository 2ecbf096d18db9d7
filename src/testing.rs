//! Test doubles shared by the unit tests of several modules.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::audio::{
    ActiveStream, AudioFormat, BufferCallback, ChunkSink, Completion, DeviceSetupError,
    InputDevice, OutputDevice, PcmBuffer,
};
use crate::config::UploadConfig;

// ---------------------------------------------------------------------------
// MockInput
// ---------------------------------------------------------------------------

/// Input device driven by the test through [`MockInput::emit`].
///
/// The callback survives `stop` so tests can simulate a late hardware
/// callback racing the shutdown.
pub struct MockInput {
    format: AudioFormat,
    fail: bool,
    callback: Mutex<Option<BufferCallback>>,
    stopped: Arc<AtomicBool>,
}

impl MockInput {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            fail: false,
            callback: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A device whose `open` always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(AudioFormat::canonical())
        }
    }

    /// Deliver `buffer` as the audio thread would.  No-op before `open`.
    pub fn emit(&self, buffer: PcmBuffer) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(buffer);
        }
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct MockStream {
    stopped: Arc<AtomicBool>,
}

impl ActiveStream for MockStream {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl InputDevice for MockInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn open(&self, on_buffer: BufferCallback) -> Result<Box<dyn ActiveStream>, DeviceSetupError> {
        if self.fail {
            return Err(DeviceSetupError::NoInputDevice("mock".into()));
        }
        *self.callback.lock().unwrap() = Some(on_buffer);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

// ---------------------------------------------------------------------------
// MockOutput
// ---------------------------------------------------------------------------

/// Output device that records what was scheduled and hands the completion
/// tokens back to the test instead of playing anything.
#[derive(Default)]
pub struct MockOutput {
    fail: bool,
    scheduled: Mutex<Vec<PcmBuffer>>,
    completions: Mutex<Vec<Completion>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockOutput {
    /// A device whose `start` always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Completion tokens not yet taken, in schedule order.
    pub fn take_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.lock().unwrap())
    }

    /// Every buffer scheduled so far.
    pub fn scheduled(&self) -> Vec<PcmBuffer> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl OutputDevice for MockOutput {
    fn format(&self) -> AudioFormat {
        AudioFormat::canonical()
    }

    fn start(&self) -> Result<(), DeviceSetupError> {
        if self.fail {
            return Err(DeviceSetupError::NoOutputDevice("mock".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn schedule(&self, buffer: PcmBuffer, done: Completion) {
        self.scheduled.lock().unwrap().push(buffer);
        self.completions.lock().unwrap().push(done);
    }

    // Keeps the recorded tokens so tests can redeem them late.
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Chunk sink that remembers everything pushed into it.
#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
    late_pushes: AtomicUsize,
}

impl RecordingSink {
    pub fn chunks(&self) -> Vec<Bytes> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pushes_after_close(&self) -> usize {
        self.late_pushes.load(Ordering::SeqCst)
    }
}

impl ChunkSink for RecordingSink {
    fn push(&self, bytes: Bytes) {
        if self.is_closed() {
            self.late_pushes.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.chunks.lock().unwrap().push(bytes);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Upload settings with short timers for tests.
pub fn test_upload_config() -> UploadConfig {
    UploadConfig {
        queue_depth: 16,
        keepalive_delay_ms: 20,
        filler_bytes: 4096,
        connect_timeout_secs: 5,
        close_grace_ms: 200,
        reject_window_ms: 300,
    }
}

/// Read from `socket` into `buf` until `done(buf)` holds, the peer closes,
/// or five seconds pass.  Returns whether `done` was satisfied.
pub async fn read_until(
    socket: &mut TcpStream,
    buf: &mut Vec<u8>,
    done: impl Fn(&[u8]) -> bool,
) -> bool {
    let read = async {
        let mut scratch = [0_u8; 8192];
        while !done(buf) {
            match socket.read(&mut scratch).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
            }
        }
        true
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .unwrap_or(false)
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Payload of an HTTP/1.1 chunked body.  Stops at the terminator or at the
/// first incomplete chunk.
pub fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = find(raw, b"\r\n") {
        let size_field = String::from_utf8_lossy(&raw[..line_end]);
        let size_hex = size_field.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if raw.len() < start + size + 2 {
            break;
        }
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}
