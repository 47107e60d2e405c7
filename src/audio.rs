//! Raw audio frames and PCM helpers
//!
//! Browser clients stream 16-bit little-endian mono PCM. Frames are kept as
//! received and only decoded where a backend needs samples (energy detection,
//! WAV uploads).

use axum::body::Bytes;

use crate::{Error, Result};

/// Default sample rate expected from clients (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per PCM16 sample
const BYTES_PER_SAMPLE: usize = 2;

/// One immutable frame of PCM audio as received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk(Bytes);

impl AudioChunk {
    /// Wrap a received frame
    #[must_use]
    pub const fn new(data: Bytes) -> Self {
        Self(data)
    }

    /// Raw frame bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode to f32 samples in `[-1.0, 1.0]`
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        pcm16_to_f32(&self.0)
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<Bytes> for AudioChunk {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

/// Decode little-endian PCM16 into f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Number of bytes that hold `ms` milliseconds of PCM16 mono audio
#[must_use]
pub fn bytes_for_duration(ms: u64, sample_rate: u32) -> usize {
    let samples = u64::from(sample_rate) * ms / 1000;
    usize::try_from(samples).unwrap_or(usize::MAX).saturating_mul(BYTES_PER_SAMPLE)
}

/// Duration in milliseconds of `bytes` of PCM16 mono audio
#[must_use]
pub fn duration_ms(bytes: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    let samples = (bytes / BYTES_PER_SAMPLE) as u64;
    samples * 1000 / u64::from(sample_rate)
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Concatenate PCM16 chunks into WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn chunks_to_wav(chunks: &[AudioChunk], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for chunk in chunks {
            for pair in chunk.as_bytes().chunks_exact(BYTES_PER_SAMPLE) {
                writer
                    .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                    .map_err(|e| Error::Audio(e.to_string()))?;
            }
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Encode f32 samples as PCM16 little-endian bytes
#[must_use]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            #[allow(clippy::cast_possible_truncation)]
            let sample = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            sample.to_le_bytes()
        })
        .collect()
}
