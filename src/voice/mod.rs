//! Voice processing module
//!
//! Handles PCM framing, voice activity detection, and streaming
//! transcription against pluggable STT backends.

pub mod audio;
mod recorder;
pub mod stt;
pub mod transcription;
pub mod vad;

pub use audio::{FRAME_DURATION_MS, FrameAssembler, SAMPLE_RATE, frame_bytes, frame_energy_db};
pub use recorder::{AudioSink, WavRecorder};
pub use stt::{HttpSttBackend, Recognition, SttBackend, SttInput, SttProvider, UnconfiguredStt};
pub use transcription::{TranscriptionConfig, TranscriptionCoordinator, TranscriptionResult};
pub use vad::{CalibrationResult, VadConfig, VadEngine, VadEvent};
