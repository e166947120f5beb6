//! TOML configuration file loading
//!
//! Supports `~/.config/storyvoice/config.toml` (or a path given with
//! `--config`) as a persistent config source. Every field is optional; the
//! file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerFileConfig,
    pub audio: AudioFileConfig,
    pub calibration: CalibrationFileConfig,
    pub stt: SttFileConfig,
    pub ai: AiFileConfig,
    pub gateway: GatewayFileConfig,
    pub storage: StorageFileConfig,
}

/// HTTP server settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    /// Bearer key for the session REST routes
    pub api_key: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
}

/// Audio framing and VAD tuning
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_duration_ms: Option<u32>,
    pub vad_aggressiveness: Option<u8>,
    pub min_speech_frames: Option<u32>,
    pub min_silence_frames: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CalibrationFileConfig {
    pub duration_ms: Option<u64>,
    pub max_frames: Option<usize>,
    pub instructions: Option<String>,
}

/// Speech-to-text settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SttFileConfig {
    /// "whisper" or "deepgram"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub max_stream_secs: Option<u64>,
    pub final_timeout_secs: Option<u64>,
    pub openai_api_key: Option<String>,
    pub deepgram_api_key: Option<String>,
}

/// LLM settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AiFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_response_chars: Option<usize>,
    pub history_turns: Option<usize>,
}

/// Protocol gateway settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewayFileConfig {
    pub idle_timeout_secs: Option<u64>,
    pub jwt_secret: Option<String>,
    pub orphan_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageFileConfig {
    pub data_dir: Option<String>,
    pub record_audio: Option<bool>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> ConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/storyvoice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("storyvoice").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9000\n\n[audio]\nvad_aggressiveness = 3\n",
        )
        .unwrap();

        let fc = load_config_file(Some(&path));
        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.audio.vad_aggressiveness, Some(3));
        assert!(fc.ai.model.is_none());
    }

    #[test]
    fn test_invalid_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let fc = load_config_file(Some(&path));
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file(Some(&dir.path().join("absent.toml")));
        assert!(fc.storage.data_dir.is_none());
    }
}
