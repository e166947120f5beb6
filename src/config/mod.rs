//! Configuration management for the story voice gateway
//!
//! Values are resolved env > toml > default. CLI flags are applied on top
//! by the binary.

pub mod file;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::ai::{LlmBackend, OpenAiCompatibleLlm, ResponderConfig, RetryPolicy, UnconfiguredLlm};
use crate::session::{CalibrationSettings, SessionConfig};
use crate::voice::{
    AudioSink, HttpSttBackend, SttBackend, SttProvider, TranscriptionConfig, UnconfiguredStt,
    VadConfig, WavRecorder,
};
use crate::{Error, Result};

use self::file::ConfigFile;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub vad: VadConfig,
    pub calibration: CalibrationSettings,
    pub stt: SttConfig,
    pub ai: AiConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for the session routes (from `STORYVOICE_API_KEY`)
    pub api_key: Option<SecretString>,

    /// Global request budget
    pub rate_limit_per_minute: u32,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Provider to use; `None` disables transcription
    pub provider: Option<SttProvider>,
    pub model: String,
    pub language: Option<String>,
    pub max_stream_duration: Duration,
    /// How long an utterance waits for its final result
    pub final_timeout: Duration,
    pub openai_api_key: Option<SecretString>,
    pub deepgram_api_key: Option<SecretString>,
}

/// LLM configuration
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// OpenAI-compatible base url
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_response_chars: usize,
    pub history_turns: usize,
}

/// Protocol gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Connection closes after this long without traffic
    pub idle_timeout: Duration,

    /// HS256 secret for session tokens; `None` accepts any non-empty token
    pub jwt_secret: Option<SecretString>,

    /// Sessions with no connection for this long are ended
    pub orphan_ttl: Duration,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to data directory (database, recordings)
    pub data_dir: PathBuf,

    /// Write finalized segments as WAV files
    pub record_audio: bool,
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if the resolved audio settings are invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path);
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved audio settings are invalid
    pub fn resolve(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|s| s.trim().parse::<u64>().ok());
        let secret = |value: Option<String>| {
            value
                .filter(|s| !s.trim().is_empty())
                .map(SecretString::from)
        };

        let server = ServerConfig {
            port: env("STORYVOICE_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(8090),
            api_key: secret(env("STORYVOICE_API_KEY").or(fc.server.api_key)),
            rate_limit_per_minute: env_parse("STORYVOICE_RATE_LIMIT")
                .and_then(|v| u32::try_from(v).ok())
                .or(fc.server.rate_limit_per_minute)
                .unwrap_or(120),
        };

        let vad_defaults = VadConfig::default();
        let vad = VadConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(vad_defaults.sample_rate),
            frame_duration_ms: fc
                .audio
                .frame_duration_ms
                .unwrap_or(vad_defaults.frame_duration_ms),
            aggressiveness: env("STORYVOICE_VAD_AGGRESSIVENESS")
                .and_then(|s| s.parse().ok())
                .or(fc.audio.vad_aggressiveness)
                .unwrap_or(vad_defaults.aggressiveness),
            min_speech_frames: fc
                .audio
                .min_speech_frames
                .unwrap_or(vad_defaults.min_speech_frames),
            min_silence_frames: fc
                .audio
                .min_silence_frames
                .unwrap_or(vad_defaults.min_silence_frames),
        };
        vad.validate()?;

        let calibration_defaults = CalibrationSettings::default();
        let calibration = CalibrationSettings {
            duration_ms: fc
                .calibration
                .duration_ms
                .unwrap_or(calibration_defaults.duration_ms),
            max_frames: fc
                .calibration
                .max_frames
                .unwrap_or(calibration_defaults.max_frames),
            instructions: fc
                .calibration
                .instructions
                .unwrap_or(calibration_defaults.instructions),
        };

        let provider = match env("STORYVOICE_STT_PROVIDER")
            .or(fc.stt.provider)
            .as_deref()
            .map(str::trim)
        {
            None | Some("" | "none") => None,
            Some("whisper" | "openai") => Some(SttProvider::Whisper),
            Some("deepgram") => Some(SttProvider::Deepgram),
            Some(other) => {
                return Err(Error::Config(format!("unknown STT provider: {other}")));
            }
        };
        let default_stt_model = match provider {
            Some(SttProvider::Deepgram) => "nova-2",
            _ => "whisper-1",
        };
        let openai_api_key = secret(env("OPENAI_API_KEY").or(fc.stt.openai_api_key));
        let stt = SttConfig {
            provider,
            model: env("STORYVOICE_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| default_stt_model.to_string()),
            language: env("STORYVOICE_STT_LANGUAGE")
                .or(fc.stt.language)
                .or_else(|| Some("zh".to_string())),
            max_stream_duration: Duration::from_secs(fc.stt.max_stream_secs.unwrap_or(290)),
            final_timeout: Duration::from_secs(fc.stt.final_timeout_secs.unwrap_or(10)),
            openai_api_key: openai_api_key.clone(),
            deepgram_api_key: secret(env("DEEPGRAM_API_KEY").or(fc.stt.deepgram_api_key)),
        };

        let ai = AiConfig {
            base_url: env("STORYVOICE_AI_BASE_URL")
                .or(fc.ai.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env("STORYVOICE_AI_MODEL")
                .or(fc.ai.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: secret(env("STORYVOICE_AI_API_KEY").or(fc.ai.api_key))
                .or(openai_api_key),
            timeout: Duration::from_secs(
                env_parse("STORYVOICE_AI_TIMEOUT_SECS")
                    .or(fc.ai.timeout_secs)
                    .unwrap_or(10),
            ),
            max_retries: fc.ai.max_retries.unwrap_or(2),
            max_response_chars: fc.ai.max_response_chars.unwrap_or(120),
            history_turns: fc.ai.history_turns.unwrap_or(6),
        };

        let gateway = GatewayConfig {
            idle_timeout: Duration::from_secs(
                env_parse("STORYVOICE_IDLE_TIMEOUT_SECS")
                    .or(fc.gateway.idle_timeout_secs)
                    .unwrap_or(120),
            ),
            jwt_secret: secret(env("STORYVOICE_JWT_SECRET").or(fc.gateway.jwt_secret)),
            orphan_ttl: Duration::from_secs(fc.gateway.orphan_ttl_secs.unwrap_or(600)),
        };

        let storage = StorageConfig {
            data_dir: env("STORYVOICE_DATA_DIR")
                .or(fc.storage.data_dir)
                .map_or_else(default_data_dir, PathBuf::from),
            record_audio: env("STORYVOICE_RECORD_AUDIO")
                .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
                .or(fc.storage.record_audio)
                .unwrap_or(false),
        };

        Ok(Self {
            server,
            vad,
            calibration,
            stt,
            ai,
            gateway,
            storage,
        })
    }

    /// Path of the `SQLite` database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join("storyvoice.db")
    }

    /// Engine settings handed to every session
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            vad: self.vad.clone(),
            transcription: TranscriptionConfig {
                max_stream_duration: self.stt.max_stream_duration,
                ..TranscriptionConfig::default()
            },
            responder: ResponderConfig {
                timeout: self.ai.timeout,
                retry: RetryPolicy {
                    max_retries: self.ai.max_retries,
                    ..RetryPolicy::default()
                },
                max_response_chars: self.ai.max_response_chars,
                history_turns: self.ai.history_turns,
            },
            final_timeout: self.stt.final_timeout,
            calibration: self.calibration.clone(),
        }
    }

    /// Build the configured STT backend
    ///
    /// Falls back to [`UnconfiguredStt`] when no provider is set.
    ///
    /// # Errors
    ///
    /// Returns error if the selected provider has no API key
    pub fn stt_backend(&self) -> Result<Arc<dyn SttBackend>> {
        let missing = |name: &str| Error::Config(format!("{name} API key required for STT"));
        let backend: Arc<dyn SttBackend> = match self.stt.provider {
            None => {
                tracing::warn!("no STT provider configured, utterances will transcribe empty");
                Arc::new(UnconfiguredStt)
            }
            Some(SttProvider::Whisper) => {
                let key = self
                    .stt
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| missing("OpenAI"))?;
                Arc::new(
                    HttpSttBackend::new_whisper(key, self.stt.model.clone(), self.vad.sample_rate)?
                        .with_language(self.stt.language.clone()),
                )
            }
            Some(SttProvider::Deepgram) => {
                let key = self
                    .stt
                    .deepgram_api_key
                    .clone()
                    .ok_or_else(|| missing("Deepgram"))?;
                Arc::new(
                    HttpSttBackend::new_deepgram(key, self.stt.model.clone(), self.vad.sample_rate)?
                        .with_language(self.stt.language.clone()),
                )
            }
        };
        Ok(backend)
    }

    /// Build the configured LLM backend
    ///
    /// Without an API key every call fails and sessions answer with fallbacks.
    #[must_use]
    pub fn llm_backend(&self) -> Arc<dyn LlmBackend> {
        match &self.ai.api_key {
            Some(key) if !key.expose_secret().is_empty() => Arc::new(OpenAiCompatibleLlm::new(
                self.ai.base_url.clone(),
                key.clone(),
                self.ai.model.clone(),
            )),
            _ => {
                tracing::warn!("no LLM API key configured, all replies will be fallbacks");
                Arc::new(UnconfiguredLlm)
            }
        }
    }

    /// Segment recorder, present only when recording is enabled
    #[must_use]
    pub fn audio_sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.storage.record_audio.then(|| {
            Arc::new(WavRecorder::new(
                self.storage.data_dir.join("recordings"),
                self.vad.sample_rate,
            )) as Arc<dyn AudioSink>
        })
    }
}

/// Default data directory: `~/.local/share/storyvoice/`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/storyvoice"),
        |d| d.data_dir().join("storyvoice"),
    )
}
