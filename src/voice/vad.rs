//! Voice activity detection with noise calibration
//!
//! Frames are classified by comparing their energy against the calibrated
//! noise floor plus a margin chosen by the aggressiveness level. A run-length
//! detector on top of the classifier turns per-frame decisions into
//! speech start/end events: onset is debounced over a few frames, offset
//! waits for a longer run of silence so mid-sentence pauses do not split a
//! segment.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::audio::{frame_bytes, frame_energy_db};
use crate::{Error, Result};

/// Noise floor assumed before calibration, and when calibrating on nothing
pub const DEFAULT_NOISE_FLOOR_DB: f32 = -50.0;

/// Lowest noise floor a calibration may report
pub const MIN_NOISE_FLOOR_DB: f32 = -60.0;

/// Highest noise floor a calibration may report
pub const MAX_NOISE_FLOOR_DB: f32 = -20.0;

/// Speech margin above the noise floor for each aggressiveness level
const MARGIN_DB: [f32; 4] = [6.0, 9.0, 12.0, 15.0];

/// VAD configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate of incoming audio
    pub sample_rate: u32,
    /// Frame duration in milliseconds (10, 20 or 30)
    pub frame_duration_ms: u32,
    /// Classifier aggressiveness, 0 (permissive) to 3 (strict)
    pub aggressiveness: u8,
    /// Consecutive speech frames needed before speech starts
    pub min_speech_frames: u32,
    /// Consecutive silence frames needed before speech ends
    pub min_silence_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: super::audio::SAMPLE_RATE,
            frame_duration_ms: super::audio::FRAME_DURATION_MS,
            aggressiveness: 2,
            min_speech_frames: 3,
            min_silence_frames: 20,
        }
    }
}

impl VadConfig {
    /// Byte length of one frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        frame_bytes(self.sample_rate, self.frame_duration_ms)
    }

    /// Check the configuration for values the detector cannot run with
    ///
    /// # Errors
    ///
    /// Returns error for an unsupported frame duration, aggressiveness above 3,
    /// or zero-length run thresholds
    pub fn validate(&self) -> Result<()> {
        if ![10, 20, 30].contains(&self.frame_duration_ms) {
            return Err(Error::Config(format!(
                "frame duration must be 10, 20 or 30 ms, got {}",
                self.frame_duration_ms
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".to_string()));
        }
        if self.aggressiveness > 3 {
            return Err(Error::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.aggressiveness
            )));
        }
        if self.min_speech_frames == 0 || self.min_silence_frames == 0 {
            return Err(Error::Config(
                "VAD run thresholds must be at least one frame".to_string(),
            ));
        }
        Ok(())
    }
}

/// Speech boundary reported by [`VadEngine::process_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Speech began; `duration_ms` covers the debounced onset run
    SpeechStarted { duration_ms: u32 },
    /// Speech ended; `duration_ms` covers the segment without trailing silence
    SpeechEnded { duration_ms: u32 },
}

/// Ambient noise statistics measured during calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    /// Mean frame energy, clamped into [-60, -20] dB
    pub noise_floor_db: f32,
    /// 90th-percentile frame energy, clamped into the same range
    pub percentile_90_db: f32,
    /// Number of frames measured
    pub sample_count: usize,
    /// Audio duration covered by the measured frames
    pub calibration_duration_ms: u64,
}

#[derive(Debug)]
struct DetectorState {
    aggressiveness: u8,
    noise_floor_db: f32,
    speech_run: u32,
    silence_run: u32,
    segment_frames: u32,
    in_speech: bool,
}

impl DetectorState {
    const fn clear_runs(&mut self) {
        self.speech_run = 0;
        self.silence_run = 0;
        self.segment_frames = 0;
        self.in_speech = false;
    }
}

/// Thread-safe voice activity detector
#[derive(Debug)]
pub struct VadEngine {
    config: VadConfig,
    frame_bytes: usize,
    state: Mutex<DetectorState>,
}

impl VadEngine {
    /// Create a detector
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: VadConfig) -> Result<Self> {
        config.validate()?;

        tracing::debug!(
            sample_rate = config.sample_rate,
            frame_ms = config.frame_duration_ms,
            aggressiveness = config.aggressiveness,
            "VAD initialized"
        );

        Ok(Self {
            frame_bytes: config.frame_bytes(),
            state: Mutex::new(DetectorState {
                aggressiveness: config.aggressiveness,
                noise_floor_db: DEFAULT_NOISE_FLOOR_DB,
                speech_run: 0,
                silence_run: 0,
                segment_frames: 0,
                in_speech: false,
            }),
            config,
        })
    }

    /// Detector configuration
    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Expected byte length of a frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    fn check_frame(&self, frame: &[u8]) -> Result<()> {
        if frame.len() == self.frame_bytes {
            Ok(())
        } else {
            Err(Error::FrameSize {
                expected: self.frame_bytes,
                actual: frame.len(),
            })
        }
    }

    fn classify(frame: &[u8], state: &DetectorState) -> bool {
        let margin = MARGIN_DB[usize::from(state.aggressiveness.min(3))];
        frame_energy_db(frame) > state.noise_floor_db + margin
    }

    /// Classify a single frame as speech or silence
    ///
    /// # Errors
    ///
    /// Returns error if the frame has the wrong byte length
    pub fn is_speech(&self, frame: &[u8]) -> Result<bool> {
        self.check_frame(frame)?;
        let state = self.state.lock();
        Ok(Self::classify(frame, &state))
    }

    /// Feed one frame through the run-length detector
    ///
    /// # Errors
    ///
    /// Returns error if the frame has the wrong byte length
    pub fn process_frame(&self, frame: &[u8]) -> Result<Option<VadEvent>> {
        self.check_frame(frame)?;
        let frame_ms = self.config.frame_duration_ms;

        let mut state = self.state.lock();
        let speech = Self::classify(frame, &state);

        if speech {
            state.speech_run += 1;
            state.silence_run = 0;
        } else {
            state.silence_run += 1;
            state.speech_run = 0;
        }

        if !state.in_speech {
            if state.speech_run >= self.config.min_speech_frames {
                state.in_speech = true;
                state.segment_frames = state.speech_run;
                let duration_ms = state.speech_run * frame_ms;
                tracing::trace!(duration_ms, "speech started");
                return Ok(Some(VadEvent::SpeechStarted { duration_ms }));
            }
            return Ok(None);
        }

        state.segment_frames += 1;
        if state.silence_run >= self.config.min_silence_frames {
            let voiced = state.segment_frames.saturating_sub(state.silence_run);
            state.clear_runs();
            let duration_ms = voiced * frame_ms;
            tracing::trace!(duration_ms, "speech ended");
            return Ok(Some(VadEvent::SpeechEnded { duration_ms }));
        }

        Ok(None)
    }

    /// Measure ambient noise over a buffer of frames
    ///
    /// Frames of the wrong size are skipped. An empty buffer yields the
    /// default floor with a sample count of zero. The detector adopts the
    /// resulting noise floor.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn calibrate(&self, frames: &[Vec<u8>]) -> CalibrationResult {
        let mut energies: Vec<f32> = frames
            .iter()
            .filter(|f| f.len() == self.frame_bytes)
            .map(|f| frame_energy_db(f))
            .collect();

        let skipped = frames.len() - energies.len();
        if skipped > 0 {
            tracing::warn!(skipped, "ignored calibration frames with wrong size");
        }

        let result = if energies.is_empty() {
            tracing::warn!("calibrating on an empty buffer, using default noise floor");
            CalibrationResult {
                noise_floor_db: DEFAULT_NOISE_FLOOR_DB,
                percentile_90_db: DEFAULT_NOISE_FLOOR_DB,
                sample_count: 0,
                calibration_duration_ms: 0,
            }
        } else {
            let count = energies.len();
            let mean = energies.iter().map(|&e| f64::from(e)).sum::<f64>() / count as f64;

            energies.sort_by(f32::total_cmp);
            // Nearest-rank percentile
            let rank = ((0.9 * count as f64).ceil() as usize).clamp(1, count);
            let p90 = energies[rank - 1];

            CalibrationResult {
                noise_floor_db: clamp_floor(mean as f32),
                percentile_90_db: clamp_floor(p90),
                sample_count: count,
                calibration_duration_ms: count as u64 * u64::from(self.config.frame_duration_ms),
            }
        };

        self.set_noise_floor(result.noise_floor_db);

        tracing::info!(
            noise_floor_db = result.noise_floor_db,
            percentile_90_db = result.percentile_90_db,
            samples = result.sample_count,
            "calibration complete"
        );

        result
    }

    /// Clear all run-length state
    pub fn reset(&self) {
        self.state.lock().clear_runs();
    }

    /// Change classifier aggressiveness at runtime
    ///
    /// # Errors
    ///
    /// Returns error if `level` is above 3
    pub fn set_aggressiveness(&self, level: u8) -> Result<()> {
        if level > 3 {
            return Err(Error::Config(format!(
                "VAD aggressiveness must be 0-3, got {level}"
            )));
        }
        self.state.lock().aggressiveness = level;
        Ok(())
    }

    /// Current classifier aggressiveness
    #[must_use]
    pub fn aggressiveness(&self) -> u8 {
        self.state.lock().aggressiveness
    }

    /// Override the noise floor used by the classifier
    pub fn set_noise_floor(&self, noise_floor_db: f32) {
        self.state.lock().noise_floor_db = clamp_floor(noise_floor_db);
    }

    /// Noise floor currently used by the classifier
    #[must_use]
    pub fn noise_floor_db(&self) -> f32 {
        self.state.lock().noise_floor_db
    }

    /// Whether the detector is inside a speech run
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.state.lock().in_speech
    }
}

fn clamp_floor(db: f32) -> f32 {
    db.clamp(MIN_NOISE_FLOOR_DB, MAX_NOISE_FLOOR_DB)
}
