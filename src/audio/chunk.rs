//! Raw PCM chunk encoding.
//!
//! A chunk on the wire is nothing but interleaved little-endian `i16`
//! samples: no header, no framing.  Chunk boundaries carry no meaning; only
//! the total byte count matters, so a receiver may split or merge chunks
//! freely as long as it respects whole frames.

use bytes::Bytes;
use thiserror::Error;

use super::format::{AudioFormat, PcmBuffer, SampleEncoding, BYTES_PER_SAMPLE};

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// A chunk could not be decoded cleanly.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The chunk ended mid-frame.  `recovered` holds every whole frame; the
    /// trailing `dropped` bytes were discarded.
    #[error("chunk of {len} bytes ends mid-frame; dropped {dropped} trailing byte(s)")]
    PartialFrame {
        recovered: PcmBuffer,
        len: usize,
        dropped: usize,
    },

    /// The target format cannot describe 16-bit PCM frames.
    #[error("cannot decode into {0:?}")]
    InvalidFormat(AudioFormat),
}

impl DecodeError {
    /// The whole frames salvaged from the chunk, if any.
    pub fn into_recovered(self) -> Option<PcmBuffer> {
        match self {
            DecodeError::PartialFrame { recovered, .. } => Some(recovered),
            DecodeError::InvalidFormat(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// encode / decode
// ---------------------------------------------------------------------------

/// Serialize `buffer` to raw little-endian sample bytes.
///
/// ```
/// use voice_broadcast::audio::{chunk, AudioFormat, PcmBuffer};
///
/// let buf = PcmBuffer::silence(AudioFormat::canonical(), 100);
/// assert_eq!(chunk::encode(buf).len(), 200);
/// ```
pub fn encode(buffer: PcmBuffer) -> Bytes {
    let samples = buffer.into_samples();
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

/// Parse raw little-endian sample bytes as frames of `format`.
///
/// # Errors
///
/// * [`DecodeError::PartialFrame`] when `bytes.len()` is not a multiple of
///   the frame size; the error still carries the decoded whole frames.
/// * [`DecodeError::InvalidFormat`] for zero-channel or non-16-bit formats.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<PcmBuffer, DecodeError> {
    if format.channels == 0 || format.encoding != SampleEncoding::I16 {
        return Err(DecodeError::InvalidFormat(format));
    }

    let frame_size = format.frame_size();
    let whole = bytes.len() - bytes.len() % frame_size;
    let samples = bytes[..whole]
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let buffer = PcmBuffer::new(format, samples);

    if whole == bytes.len() {
        Ok(buffer)
    } else {
        Err(DecodeError::PartialFrame {
            recovered: buffer,
            len: bytes.len(),
            dropped: bytes.len() - whole,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(format: AudioFormat, frames: usize) -> PcmBuffer {
        let n = frames * format.channels as usize;
        PcmBuffer::new(format, (0..n).map(|i| (i as i16).wrapping_mul(257)).collect())
    }

    #[test]
    fn hundred_mono_frames_is_two_hundred_bytes() {
        let bytes = encode(ramp(AudioFormat::canonical(), 100));
        assert_eq!(bytes.len(), 200);

        let decoded = decode(&bytes, AudioFormat::canonical()).unwrap();
        assert_eq!(decoded.frame_count(), 100);
    }

    #[test]
    fn round_trip_preserves_samples() {
        for format in [AudioFormat::canonical(), AudioFormat::new(48_000, 2)] {
            let original = ramp(format, 64);
            let decoded = decode(&encode(original.clone()), format).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn encoding_is_little_endian() {
        let buf = PcmBuffer::new(AudioFormat::canonical(), vec![0x0102, -1]);
        assert_eq!(&encode(buf)[..], &[0x02, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        let format = AudioFormat::new(44_100, 2); // 4-byte frames
        let original = ramp(format, 10);
        let mut bytes = encode(original.clone()).to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        match decode(&bytes, format) {
            Err(DecodeError::PartialFrame {
                recovered,
                len,
                dropped,
            }) => {
                assert_eq!(len, 43);
                assert_eq!(dropped, 3);
                assert_eq!(recovered, original);
            }
            other => panic!("expected PartialFrame, got {other:?}"),
        }
    }

    #[test]
    fn odd_byte_mono_chunk_recovers_prefix() {
        let err = decode(&[1, 0, 2, 0, 9], AudioFormat::canonical()).unwrap_err();
        let recovered = err.into_recovered().expect("prefix recovered");
        assert_eq!(recovered.samples(), &[1, 2]);
    }

    #[test]
    fn chunk_shorter_than_a_frame_recovers_empty_buffer() {
        let err = decode(&[7], AudioFormat::canonical()).unwrap_err();
        assert!(err.into_recovered().unwrap().is_empty());
    }

    #[test]
    fn zero_channel_format_is_rejected() {
        let err = decode(&[0, 0], AudioFormat::new(44_100, 0)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat(_)));
        assert!(err.into_recovered().is_none());
    }

    #[test]
    fn empty_chunk_decodes_to_empty_buffer() {
        let buf = decode(&[], AudioFormat::canonical()).unwrap();
        assert!(buf.is_empty());
    }
}
