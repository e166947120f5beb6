//! PCM frame helpers
//!
//! Audio arrives as 16-bit little-endian mono PCM. Everything downstream
//! works on fixed-size frames, so binary messages are re-framed here first.

use crate::{Error, Result};

/// Default sample rate for client audio
pub const SAMPLE_RATE: u32 = 16_000;

/// Default frame duration in milliseconds
pub const FRAME_DURATION_MS: u32 = 30;

/// Energy reported for silent (zero RMS) frames
pub const ENERGY_FLOOR_DB: f32 = -100.0;

/// Full-scale reference for 16-bit samples
const FULL_SCALE: f64 = 32768.0;

/// Number of samples in one frame
#[must_use]
pub const fn frame_samples(sample_rate: u32, frame_duration_ms: u32) -> usize {
    (sample_rate as usize * frame_duration_ms as usize) / 1000
}

/// Number of bytes in one 16-bit mono frame
#[must_use]
pub const fn frame_bytes(sample_rate: u32, frame_duration_ms: u32) -> usize {
    frame_samples(sample_rate, frame_duration_ms) * 2
}

/// Decode little-endian 16-bit PCM bytes into samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian 16-bit PCM bytes
#[must_use]
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Frame energy in dBFS: `20·log10(RMS / 32768)`, floored at -100 dB
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
#[must_use]
pub fn frame_energy_db(frame: &[u8]) -> f32 {
    let samples = pcm_to_samples(frame);
    if samples.is_empty() {
        return ENERGY_FLOOR_DB;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s);
            v * v
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    if rms < 1e-9 {
        return ENERGY_FLOOR_DB;
    }

    ((20.0 * (rms / FULL_SCALE).log10()) as f32).max(ENERGY_FLOOR_DB)
}

/// Convert PCM bytes to WAV bytes for STT APIs and recordings
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
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

        for sample in pcm_to_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Splits arbitrary-length binary messages into fixed-size frames
///
/// Bytes that do not fill a whole frame are carried over to the next push.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_bytes` bytes
    #[must_use]
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(2),
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    /// Append bytes and return every complete frame
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);

        let complete = self.pending.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let rest = self.pending.split_off(complete * self.frame_bytes);
        let frames = self
            .pending
            .chunks_exact(self.frame_bytes)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending = rest;
        frames
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Bytes waiting for the rest of a frame
    #[must_use]
    pub const fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
