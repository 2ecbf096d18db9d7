//! Audio format descriptors and the owned PCM buffer that moves between
//! pipeline stages.
//!
//! Every buffer handed from one stage to the next is a [`PcmBuffer`] holding
//! interleaved `i16` samples.  Stages take buffers **by value** so exactly one
//! stage owns the samples at any time.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sample rate of the canonical wire format (Hz).
pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;

/// Channel count of the canonical wire format.
pub const CANONICAL_CHANNELS: u16 = 1;

/// Size of one 16-bit sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 2;

// ---------------------------------------------------------------------------
// SampleEncoding
// ---------------------------------------------------------------------------

/// How individual samples are stored.
///
/// PCM buffers are always [`SampleEncoding::I16`]; `F32` only describes the
/// native format an audio device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Signed 16-bit integer, little-endian on the wire.
    I16,
    /// 32-bit float in `[-1.0, 1.0]`.
    F32,
}

// ---------------------------------------------------------------------------
// AudioFormat
// ---------------------------------------------------------------------------

/// Describes a stream of interleaved PCM samples.
///
/// Two formats are compatible only when every field matches; anything else
/// needs a [`FormatConverter`](crate::audio::FormatConverter) pass first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Frames per second (Hz).
    pub sample_rate: u32,
    /// Interleaved channels per frame.
    pub channels: u16,
    /// Sample storage.
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// A 16-bit integer format with the given rate and channel count.
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            encoding: SampleEncoding::I16,
        }
    }

    /// The wire format: 44.1 kHz, mono, 16-bit signed.
    ///
    /// ```
    /// use voice_broadcast::audio::AudioFormat;
    ///
    /// let f = AudioFormat::canonical();
    /// assert_eq!(f.sample_rate, 44_100);
    /// assert_eq!(f.channels, 1);
    /// assert_eq!(f.frame_size(), 2);
    /// ```
    pub const fn canonical() -> Self {
        Self::new(CANONICAL_SAMPLE_RATE, CANONICAL_CHANNELS)
    }

    /// Same rate and layout, different sample encoding.
    pub const fn with_encoding(self, encoding: SampleEncoding) -> Self {
        Self { encoding, ..self }
    }

    /// Bytes per interleaved frame once encoded as 16-bit PCM.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// `true` when no conversion is needed between `self` and `other`.
    pub fn is_compatible(&self, other: &AudioFormat) -> bool {
        self == other
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::canonical()
    }
}

// ---------------------------------------------------------------------------
// PcmBuffer
// ---------------------------------------------------------------------------

/// An owned block of interleaved 16-bit PCM frames.
///
/// The constructor truncates any trailing partial frame, so
/// `byte_len() == frame_count() * channels * 2` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBuffer {
    format: AudioFormat,
    samples: Vec<i16>,
}

impl PcmBuffer {
    /// Wrap `samples` (interleaved) in a buffer of the given format.
    ///
    /// Samples past the last whole frame are discarded.  A zero-channel
    /// format yields an empty buffer.
    pub fn new(format: AudioFormat, mut samples: Vec<i16>) -> Self {
        debug_assert_eq!(format.encoding, SampleEncoding::I16);
        let channels = format.channels as usize;
        let whole = if channels == 0 {
            0
        } else {
            samples.len() - samples.len() % channels
        };
        samples.truncate(whole);
        Self { format, samples }
    }

    /// `frames` frames of silence.
    pub fn silence(format: AudioFormat, frames: usize) -> Self {
        Self::new(format, vec![0; frames * format.channels as usize])
    }

    /// Build a buffer from `f32` samples in `[-1.0, 1.0]`, clamping values
    /// outside that range.
    pub fn from_f32(format: AudioFormat, samples: &[f32]) -> Self {
        Self::new(format, samples.iter().map(|&s| f32_to_i16(s)).collect())
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Number of interleaved frames.
    pub fn frame_count(&self) -> usize {
        match self.format.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    /// Size of the buffer once encoded as raw 16-bit PCM.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Consume the buffer, returning its interleaved samples.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f32 / self.format.sample_rate as f32
    }
}

/// Scale a float sample to 16-bit, clamping to the valid range.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Scale a 16-bit sample to float in `[-1.0, 1.0]`.
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_format_fields() {
        let f = AudioFormat::canonical();
        assert_eq!(f.sample_rate, 44_100);
        assert_eq!(f.channels, 1);
        assert_eq!(f.encoding, SampleEncoding::I16);
    }

    #[test]
    fn compatibility_requires_every_field() {
        let a = AudioFormat::new(44_100, 1);
        assert!(a.is_compatible(&AudioFormat::canonical()));
        assert!(!a.is_compatible(&AudioFormat::new(48_000, 1)));
        assert!(!a.is_compatible(&AudioFormat::new(44_100, 2)));
        assert!(!a.is_compatible(&a.with_encoding(SampleEncoding::F32)));
    }

    #[test]
    fn byte_len_matches_frames_and_channels() {
        let buf = PcmBuffer::new(AudioFormat::new(48_000, 2), vec![0; 200]);
        assert_eq!(buf.frame_count(), 100);
        assert_eq!(buf.byte_len(), buf.frame_count() * 2 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn partial_frame_is_truncated() {
        let buf = PcmBuffer::new(AudioFormat::new(48_000, 2), vec![1, 2, 3]);
        assert_eq!(buf.samples(), &[1, 2]);
        assert_eq!(buf.frame_count(), 1);
    }

    #[test]
    fn silence_has_requested_frames() {
        let buf = PcmBuffer::silence(AudioFormat::new(16_000, 2), 160);
        assert_eq!(buf.frame_count(), 160);
        assert!(buf.samples().iter().all(|&s| s == 0));
        assert!((buf.duration_secs() - 0.01).abs() < 1e-6);
    }

    #[test]
    fn float_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pcm_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<PcmBuffer>();
    }
}
