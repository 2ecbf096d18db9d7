//! Sample-rate and channel-layout conversion.
//!
//! [`StreamConverter`] turns a stream of [`PcmBuffer`]s in a device's native
//! layout into any other 16-bit layout, typically the canonical 44.1 kHz
//! mono wire format.  Two steps run in order:
//!
//! 1. [`remix`]: average down to mono, duplicate mono up, or map channels.
//! 2. Resample with `rubato`'s polynomial resampler (`FastFixedIn`).
//!
//! One resampler lives for the whole stream and input frames short of a
//! full resampler chunk are carried into the next call, so consecutive
//! buffers join without a seam.  [`StreamConverter::flush`] drains the tail;
//! afterwards the stream has produced exactly
//! `round(frames * to_rate / from_rate)` frames.
//!
//! [`FormatConverter::convert`] is the one-shot form: a single buffer
//! processed and flushed.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::format::{f32_to_i16, i16_to_f32, AudioFormat, PcmBuffer, SampleEncoding};

/// Upper bound on zero-input flushes when draining the resampler tail.
const MAX_FLUSHES: usize = 8;

/// Input frames per resampler chunk.  Bounds the carry-over latency.
const STREAM_CHUNK_FRAMES: usize = 64;

// ---------------------------------------------------------------------------
// ConversionError
// ---------------------------------------------------------------------------

/// The converter could not be built for a source/target pair.
///
/// Recoverable per buffer: the capture path logs it, drops the buffer and
/// keeps going.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("unsupported sample encoding {0:?} (only 16-bit PCM is converted)")]
    UnsupportedEncoding(SampleEncoding),

    #[error("invalid audio format: {rate} Hz, {channels} channel(s)")]
    InvalidFormat { rate: u32, channels: u16 },

    #[error("failed to construct resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Polynomial degree used by the resampler.  Higher is smoother and slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Linear,
    #[default]
    Cubic,
    Quintic,
    Septic,
}

impl Interpolation {
    fn degree(self) -> PolynomialDegree {
        match self {
            Interpolation::Linear => PolynomialDegree::Linear,
            Interpolation::Cubic => PolynomialDegree::Cubic,
            Interpolation::Quintic => PolynomialDegree::Quintic,
            Interpolation::Septic => PolynomialDegree::Septic,
        }
    }
}

// ---------------------------------------------------------------------------
// FormatConverter
// ---------------------------------------------------------------------------

/// Converts [`PcmBuffer`]s between 16-bit formats.
///
/// Holds only the interpolation setting, so one converter can be shared
/// freely between threads.  Per-stream state lives in the
/// [`StreamConverter`]s it hands out.
///
/// # Example
///
/// ```rust
/// use voice_broadcast::audio::{AudioFormat, FormatConverter, PcmBuffer};
///
/// let converter = FormatConverter::default();
/// let input = PcmBuffer::silence(AudioFormat::new(16_000, 1), 160);
/// let output = converter.convert(input, &AudioFormat::canonical()).unwrap();
/// assert_eq!(output.frame_count(), 441);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatConverter {
    interpolation: Interpolation,
}

impl FormatConverter {
    pub fn new(interpolation: Interpolation) -> Self {
        Self { interpolation }
    }

    /// Convert a single, self-contained `buffer` to `target`.
    ///
    /// Returns the input untouched when the formats already match.  Buffers
    /// that belong to a continuous stream go through [`stream`](Self::stream)
    /// instead.
    ///
    /// # Errors
    ///
    /// [`ConversionError`] when either side is not 16-bit, has zero channels
    /// or a zero sample rate, or when the resampler rejects the rate pair.
    pub fn convert(
        &self,
        buffer: PcmBuffer,
        target: &AudioFormat,
    ) -> Result<PcmBuffer, ConversionError> {
        if buffer.format() == *target {
            return Ok(buffer);
        }

        let mut stream = self.stream(*target);
        let head = stream.process(buffer)?;
        let tail = stream.flush()?;

        let mut samples = head.into_samples();
        samples.extend_from_slice(tail.samples());
        Ok(PcmBuffer::new(*target, samples))
    }

    /// Start a continuous conversion to `target`.
    pub fn stream(&self, target: AudioFormat) -> StreamConverter {
        StreamConverter::new(self.interpolation, target)
    }
}

// ---------------------------------------------------------------------------
// StreamConverter
// ---------------------------------------------------------------------------

/// Converts one continuous stream of buffers to a fixed target format.
///
/// A buffer in a different source format than the one before it restarts
/// the stream; whatever the old resampler still held is discarded.
pub struct StreamConverter {
    interpolation: Interpolation,
    target: AudioFormat,
    source: Option<AudioFormat>,
    resampler: Option<FastFixedIn<f32>>,
    /// Remixed input frames waiting for a full resampler chunk.
    carry: Vec<Vec<f32>>,
    /// Leading output frames still owed to the resampler delay.
    trim: usize,
    frames_in: usize,
    frames_out: usize,
}

impl StreamConverter {
    pub fn new(interpolation: Interpolation, target: AudioFormat) -> Self {
        Self {
            interpolation,
            target,
            source: None,
            resampler: None,
            carry: Vec::new(),
            trim: 0,
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn target(&self) -> AudioFormat {
        self.target
    }

    /// Convert the next buffer of the stream.
    ///
    /// While resampling, the output trails the input by less than one
    /// resampler chunk, so a single result may be shorter than a one-shot
    /// conversion of the same buffer (or even empty).
    ///
    /// # Errors
    ///
    /// As [`FormatConverter::convert`].  A rejected buffer leaves the stream
    /// untouched.
    pub fn process(&mut self, buffer: PcmBuffer) -> Result<PcmBuffer, ConversionError> {
        let source = buffer.format();
        if self.source != Some(source) {
            self.restart(source)?;
        }
        if source == self.target {
            return Ok(buffer);
        }

        let planar = remix(&buffer, self.target.channels);
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(interleave(&planar, self.target));
        };

        self.frames_in += buffer.frame_count();
        append_planar(&mut self.carry, planar);

        let mut out = vec![Vec::new(); self.carry.len()];
        loop {
            let needed = resampler.input_frames_next();
            if self.carry.first().map_or(0, Vec::len) < needed {
                break;
            }
            let chunk: Vec<&[f32]> = self.carry.iter().map(|plane| &plane[..needed]).collect();
            let resampled = resampler.process(&chunk, None)?;
            for plane in &mut self.carry {
                plane.drain(..needed);
            }
            self.frames_out += append_trimmed(&mut out, resampled, &mut self.trim);
        }
        Ok(interleave(&out, self.target))
    }

    /// End the stream and return everything still held back.
    ///
    /// The next [`process`](Self::process) starts a fresh stream.
    pub fn flush(&mut self) -> Result<PcmBuffer, ConversionError> {
        let tail = self.drain_tail();
        self.reset();
        tail
    }

    /// Forget the stream in progress without draining it.
    pub fn reset(&mut self) {
        self.source = None;
        self.resampler = None;
        self.carry.clear();
        self.trim = 0;
        self.frames_in = 0;
        self.frames_out = 0;
    }

    fn restart(&mut self, source: AudioFormat) -> Result<(), ConversionError> {
        let target = self.target;
        let resampler = if source == target {
            None
        } else {
            check_formats(&source, &target)?;
            if source.sample_rate == target.sample_rate {
                None
            } else {
                let ratio = target.sample_rate as f64 / source.sample_rate as f64;
                Some(FastFixedIn::<f32>::new(
                    ratio,
                    1.0,
                    self.interpolation.degree(),
                    STREAM_CHUNK_FRAMES,
                    target.channels as usize,
                )?)
            }
        };

        if self.carry.first().is_some_and(|plane| !plane.is_empty()) {
            log::debug!("converter: source changed to {source:?}, discarding carry-over");
        }
        self.reset();
        self.trim = resampler.as_ref().map_or(0, |r| r.output_delay());
        self.resampler = resampler;
        self.carry = vec![Vec::new(); target.channels as usize];
        self.source = Some(source);
        Ok(())
    }

    fn drain_tail(&mut self) -> Result<PcmBuffer, ConversionError> {
        let from_rate = self.source.map_or(0, |s| s.sample_rate);
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(PcmBuffer::new(self.target, Vec::new()));
        };
        let expected = expected_frames(self.frames_in, from_rate, self.target.sample_rate);

        let mut out = vec![Vec::new(); self.carry.len()];
        if self.carry.first().is_some_and(|plane| !plane.is_empty()) {
            let resampled = resampler.process_partial(Some(self.carry.as_slice()), None)?;
            self.frames_out += append_trimmed(&mut out, resampled, &mut self.trim);
        }

        // Flush with silence until the delayed tail has come out.
        let mut flushes = 0;
        while self.frames_out < expected && flushes < MAX_FLUSHES {
            let resampled = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            self.frames_out += append_trimmed(&mut out, resampled, &mut self.trim);
            flushes += 1;
        }

        // Pad or cut so the stream total lands on `expected`.
        let len = (out.first().map_or(0, Vec::len) + expected).saturating_sub(self.frames_out);
        for plane in &mut out {
            plane.resize(len, 0.0);
        }
        Ok(interleave(&out, self.target))
    }
}

fn check_formats(source: &AudioFormat, target: &AudioFormat) -> Result<(), ConversionError> {
    for format in [source, target] {
        if format.encoding != SampleEncoding::I16 {
            return Err(ConversionError::UnsupportedEncoding(format.encoding));
        }
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(ConversionError::InvalidFormat {
                rate: format.sample_rate,
                channels: format.channels,
            });
        }
    }
    Ok(())
}

/// Frames produced when `frames` frames at `from_rate` are resampled to
/// `to_rate`, rounded to the nearest whole frame.
///
/// ```
/// use voice_broadcast::audio::convert::expected_frames;
///
/// assert_eq!(expected_frames(160, 16_000, 44_100), 441);
/// assert_eq!(expected_frames(480, 48_000, 44_100), 441);
/// ```
pub fn expected_frames(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return 0;
    }
    (frames as f64 * to_rate as f64 / from_rate as f64).round() as usize
}

// ---------------------------------------------------------------------------
// Channel layout
// ---------------------------------------------------------------------------

/// Split `buffer` into one `f32` plane per target channel.
///
/// * N → 1 averages every channel of the frame.
/// * 1 → N duplicates the mono sample.
/// * N → M maps output channel `c` to input channel `c % N`.
pub fn remix(buffer: &PcmBuffer, target_channels: u16) -> Vec<Vec<f32>> {
    let source_channels = buffer.channels() as usize;
    let target_channels = target_channels as usize;
    let frames = buffer.frame_count();
    let mut planar = vec![Vec::with_capacity(frames); target_channels];

    if source_channels == 0 || target_channels == 0 {
        return planar;
    }

    for frame in buffer.samples().chunks_exact(source_channels) {
        if target_channels == 1 {
            let sum: f32 = frame.iter().map(|&s| i16_to_f32(s)).sum();
            planar[0].push(sum / source_channels as f32);
        } else {
            for (c, plane) in planar.iter_mut().enumerate() {
                plane.push(i16_to_f32(frame[c % source_channels]));
            }
        }
    }
    planar
}

fn interleave(planar: &[Vec<f32>], format: AudioFormat) -> PcmBuffer {
    let frames = planar.first().map_or(0, Vec::len);
    let mut samples = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for plane in planar {
            samples.push(f32_to_i16(plane.get(i).copied().unwrap_or(0.0)));
        }
    }
    PcmBuffer::new(format, samples)
}

fn append_planar(out: &mut [Vec<f32>], chunk: Vec<Vec<f32>>) {
    for (plane, extra) in out.iter_mut().zip(chunk) {
        plane.extend(extra);
    }
}

/// Append `chunk` after dropping up to `trim` leading frames.  Returns the
/// number of frames appended.
fn append_trimmed(out: &mut [Vec<f32>], chunk: Vec<Vec<f32>>, trim: &mut usize) -> usize {
    let frames = chunk.first().map_or(0, Vec::len);
    let skip = (*trim).min(frames);
    *trim -= skip;
    for (plane, extra) in out.iter_mut().zip(chunk) {
        plane.extend_from_slice(&extra[skip..]);
    }
    frames - skip
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dc(format: AudioFormat, frames: usize, value: i16) -> PcmBuffer {
        PcmBuffer::new(format, vec![value; frames * format.channels as usize])
    }

    // ---- fast path -------------------------------------------------------

    #[test]
    fn matching_format_is_returned_unchanged() {
        let input = PcmBuffer::new(AudioFormat::canonical(), vec![1, -2, 3, -4]);
        let out = FormatConverter::default()
            .convert(input.clone(), &AudioFormat::canonical())
            .unwrap();
        assert_eq!(out, input);
    }

    // ---- frame counts ----------------------------------------------------

    #[test]
    fn upsample_16k_to_44k_yields_441_frames() {
        let input = dc(AudioFormat::new(16_000, 1), 160, 1000);
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::canonical())
            .unwrap();
        assert_eq!(out.frame_count(), 441);
        assert_eq!(out.format(), AudioFormat::canonical());
    }

    #[test]
    fn downsample_48k_stereo_to_canonical() {
        let input = dc(AudioFormat::new(48_000, 2), 480, 1000);
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::canonical())
            .unwrap();
        assert_eq!(out.frame_count(), 441);
        assert_eq!(out.channels(), 1);
    }

    #[test]
    fn every_interpolation_gives_exact_length() {
        for interpolation in [
            Interpolation::Linear,
            Interpolation::Cubic,
            Interpolation::Quintic,
            Interpolation::Septic,
        ] {
            let input = dc(AudioFormat::new(22_050, 1), 1024, 0);
            let out = FormatConverter::new(interpolation)
                .convert(input, &AudioFormat::canonical())
                .unwrap();
            assert_eq!(out.frame_count(), 2048, "{interpolation:?}");
        }
    }

    #[test]
    fn empty_buffer_converts_to_empty() {
        let input = PcmBuffer::new(AudioFormat::new(48_000, 2), Vec::new());
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::canonical())
            .unwrap();
        assert!(out.is_empty());
    }

    // ---- signal ----------------------------------------------------------

    #[test]
    fn constant_signal_keeps_amplitude_in_the_middle() {
        let input = dc(AudioFormat::new(16_000, 1), 1600, 16_000);
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::canonical())
            .unwrap();
        let samples = out.samples();
        // The edges see the resampler's zero padding; the body must not.
        for &s in &samples[100..samples.len() - 100] {
            assert!((s as i32 - 16_000).abs() < 800, "amplitude drift: {s}");
        }
    }

    #[test]
    fn same_rate_stereo_to_mono_averages() {
        let input = PcmBuffer::new(AudioFormat::new(44_100, 2), vec![1000, 3000, -500, 500]);
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::canonical())
            .unwrap();
        assert_eq!(out.frame_count(), 2);
        assert!((out.samples()[0] - 2000).abs() <= 1);
        assert!(out.samples()[1].abs() <= 1);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let input = PcmBuffer::new(AudioFormat::new(44_100, 1), vec![1234, -4321]);
        let out = FormatConverter::default()
            .convert(input, &AudioFormat::new(44_100, 2))
            .unwrap();
        let s = out.samples();
        assert_eq!(s.len(), 4);
        assert_eq!(s[0], s[1]);
        assert_eq!(s[2], s[3]);
        assert!((s[0] - 1234).abs() <= 1);
    }

    // ---- streaming -------------------------------------------------------

    fn sine(format: AudioFormat, frames: usize) -> PcmBuffer {
        let samples = (0..frames)
            .map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                (f32::sin(2.0 * std::f32::consts::PI * 440.0 * t) * 12_000.0) as i16
            })
            .collect();
        PcmBuffer::new(format, samples)
    }

    fn split(buffer: &PcmBuffer, sizes: &[usize]) -> Vec<PcmBuffer> {
        let mut rest = buffer.samples();
        let mut parts = Vec::new();
        for &size in sizes.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(size.min(rest.len()));
            parts.push(PcmBuffer::new(buffer.format(), head.to_vec()));
            rest = tail;
        }
        parts
    }

    #[test]
    fn consecutive_buffers_join_without_seams() {
        let native = AudioFormat::new(48_000, 1);
        let mut stream = FormatConverter::default().stream(AudioFormat::canonical());

        let mut joined = Vec::new();
        for _ in 0..5 {
            let out = stream.process(dc(native, 480, 16_000)).unwrap();
            joined.extend_from_slice(out.samples());
        }

        assert!(joined.len() > 2_000);
        // Only the first frames see the resampler's silent history.
        for (i, &s) in joined.iter().enumerate().skip(4) {
            assert!((s as i32 - 16_000).abs() < 8, "step at frame {i}: {s}");
        }
    }

    #[test]
    fn flush_completes_the_stream_length() {
        let native = AudioFormat::new(48_000, 2);
        let mut stream = FormatConverter::default().stream(AudioFormat::canonical());

        let mut frames = 0;
        for _ in 0..5 {
            frames += stream.process(dc(native, 480, 1000)).unwrap().frame_count();
        }
        assert!(frames < 2205);
        frames += stream.flush().unwrap().frame_count();
        assert_eq!(frames, 2205);
    }

    #[test]
    fn split_stream_matches_one_shot_conversion() {
        let native = AudioFormat::new(16_000, 1);
        let whole = sine(native, 1_600);
        let converter = FormatConverter::new(Interpolation::Quintic);
        let expected = converter
            .convert(whole.clone(), &AudioFormat::canonical())
            .unwrap();

        let mut stream = converter.stream(AudioFormat::canonical());
        let mut joined = Vec::new();
        for part in split(&whole, &[100, 37, 480, 1, 250]) {
            joined.extend_from_slice(stream.process(part).unwrap().samples());
        }
        joined.extend_from_slice(stream.flush().unwrap().samples());

        assert_eq!(joined, expected.samples());
    }

    #[test]
    fn matching_stream_passes_buffers_through() {
        let mut stream = FormatConverter::default().stream(AudioFormat::canonical());
        let input = PcmBuffer::new(AudioFormat::canonical(), vec![7, 8, 9]);
        assert_eq!(stream.process(input.clone()).unwrap(), input);
        assert!(stream.flush().unwrap().is_empty());
    }

    #[test]
    fn source_change_restarts_the_stream() {
        let mut stream = FormatConverter::default().stream(AudioFormat::canonical());
        stream.process(dc(AudioFormat::new(48_000, 1), 100, 500)).unwrap();

        let out = stream.process(dc(AudioFormat::new(16_000, 1), 160, 500)).unwrap();
        let tail = stream.flush().unwrap();
        // Only the 16 kHz buffer counts towards the new stream.
        assert_eq!(out.frame_count() + tail.frame_count(), 441);
    }

    #[test]
    fn rejected_buffer_leaves_stream_running() {
        let native = AudioFormat::new(48_000, 1);
        let mut stream = FormatConverter::default().stream(AudioFormat::canonical());

        let mut frames = stream.process(dc(native, 480, 0)).unwrap().frame_count();
        assert!(stream.process(dc(AudioFormat::new(0, 1), 4, 0)).is_err());
        frames += stream.process(dc(native, 480, 0)).unwrap().frame_count();
        frames += stream.flush().unwrap().frame_count();
        assert_eq!(frames, 882);
    }

    // ---- errors ----------------------------------------------------------

    #[test]
    fn float_target_is_rejected() {
        let input = dc(AudioFormat::new(48_000, 1), 10, 0);
        let target = AudioFormat::canonical().with_encoding(SampleEncoding::F32);
        let err = FormatConverter::default().convert(input, &target).unwrap_err();
        assert!(matches!(err, ConversionError::UnsupportedEncoding(SampleEncoding::F32)));
    }

    #[test]
    fn zero_rate_target_is_rejected() {
        let input = dc(AudioFormat::new(48_000, 1), 10, 0);
        let err = FormatConverter::default()
            .convert(input, &AudioFormat::new(0, 1))
            .unwrap_err();
        assert!(matches!(err, ConversionError::InvalidFormat { rate: 0, .. }));
    }

    #[test]
    fn zero_channel_target_is_rejected() {
        let input = dc(AudioFormat::new(48_000, 1), 10, 0);
        let err = FormatConverter::default()
            .convert(input, &AudioFormat::new(44_100, 0))
            .unwrap_err();
        assert!(matches!(err, ConversionError::InvalidFormat { channels: 0, .. }));
    }

    // ---- helpers ---------------------------------------------------------

    #[test]
    fn expected_frames_rounds_to_nearest() {
        assert_eq!(expected_frames(160, 16_000, 44_100), 441);
        assert_eq!(expected_frames(1, 48_000, 44_100), 1);
        assert_eq!(expected_frames(100, 0, 44_100), 0);
    }

    #[test]
    fn remix_four_channels_to_mono() {
        let input = PcmBuffer::new(AudioFormat::new(44_100, 4), vec![8000; 4]);
        let planar = remix(&input, 1);
        assert_eq!(planar.len(), 1);
        assert!((planar[0][0] - i16_to_f32(8000)).abs() < 1e-6);
    }
}
