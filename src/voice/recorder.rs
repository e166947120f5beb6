//! Optional segment recording
//!
//! Recording is off unless `storage.record_audio` is enabled. When on, each
//! finalized segment is written as a WAV file under
//! `<root>/<session_id>/<sequence>.wav`.

use std::path::PathBuf;

use super::audio::pcm_to_wav;
use crate::Result;

/// Destination for finalized segment audio
pub trait AudioSink: Send + Sync {
    /// Store one segment's PCM audio, returning where it went
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be stored
    fn record_segment(&self, session_id: &str, sequence: u32, pcm: &[u8]) -> Result<PathBuf>;
}

/// Writes segments as WAV files on disk
#[derive(Debug, Clone)]
pub struct WavRecorder {
    root: PathBuf,
    sample_rate: u32,
}

impl WavRecorder {
    /// Create a recorder rooted at `root`
    #[must_use]
    pub const fn new(root: PathBuf, sample_rate: u32) -> Self {
        Self { root, sample_rate }
    }
}

impl AudioSink for WavRecorder {
    fn record_segment(&self, session_id: &str, sequence: u32, pcm: &[u8]) -> Result<PathBuf> {
        let dir = self.root.join(session_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{sequence:04}.wav"));
        std::fs::write(&path, pcm_to_wav(pcm, self.sample_rate)?)?;

        tracing::debug!(path = %path.display(), bytes = pcm.len(), "recorded segment");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_wav_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = WavRecorder::new(dir.path().to_path_buf(), 16_000);

        let path = recorder.record_segment("s1", 3, &[0u8; 960]).unwrap();
        assert!(path.ends_with("s1/0003.wav"));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 480);
    }
}
