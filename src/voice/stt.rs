//! Speech-to-text (STT) backends
//!
//! A backend runs one streaming recognition call: it reads audio from
//! `input` until the channel closes and writes recognitions to `output`.
//! The HTTP providers only offer prerecorded transcription, so they buffer
//! audio and transcribe when they see [`SttInput::Flush`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use super::audio::pcm_to_wav;
use crate::{Error, Result};

/// Audio or control input for a recognition call
#[derive(Debug, Clone)]
pub enum SttInput {
    /// One PCM frame
    Audio(Vec<u8>),
    /// The utterance ended; produce a final result for buffered audio
    Flush,
}

/// A recognition produced by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub is_final: bool,
    /// Confidence of a final result (0.0-1.0)
    pub confidence: f32,
    /// Stability of an interim result (0.0-1.0)
    pub stability: f32,
}

impl Recognition {
    /// A final recognition
    #[must_use]
    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
            stability: 1.0,
        }
    }

    /// An interim recognition
    #[must_use]
    pub fn interim(text: impl Into<String>, stability: f32) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: 0.0,
            stability,
        }
    }
}

/// Streaming speech-to-text backend
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Run one recognition call until `input` closes
    ///
    /// # Errors
    ///
    /// Returns error if the provider fails; the caller converts this into an
    /// empty final result
    async fn stream(
        &self,
        input: mpsc::UnboundedReceiver<SttInput>,
        output: mpsc::Sender<Recognition>,
    ) -> Result<()>;
}

/// Response from `OpenAI` Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// HTTP STT provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

/// Buffers an utterance and transcribes it over HTTP
pub struct HttpSttBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    language: Option<String>,
    sample_rate: u32,
    provider: SttProvider,
}

impl HttpSttBackend {
    /// Create a backend using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: SecretString, model: String, sample_rate: u32) -> Result<Self> {
        Self::new(SttProvider::Whisper, api_key, model, sample_rate)
    }

    /// Create a backend using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: SecretString, model: String, sample_rate: u32) -> Result<Self> {
        Self::new(SttProvider::Deepgram, api_key, model, sample_rate)
    }

    fn new(
        provider: SttProvider,
        api_key: SecretString,
        model: String,
        sample_rate: u32,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            language: None,
            sample_rate,
            provider,
        })
    }

    /// Hint the spoken language (ISO 639-1, e.g. "zh")
    #[must_use]
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    /// Transcribe buffered PCM audio
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe(&self, pcm: &[u8]) -> Result<Recognition> {
        let wav = pcm_to_wav(pcm, self.sample_rate)?;
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }

    /// Transcribe using `OpenAI` Whisper
    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<Recognition> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;

        tracing::debug!(chars = result.text.chars().count(), "transcription complete");
        // Whisper reports no confidence for plain JSON responses
        Ok(Recognition::final_text(result.text.trim(), 1.0))
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<Recognition> {
        tracing::debug!(audio_bytes = wav.len(), "starting Deepgram transcription");

        let mut url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );
        if let Some(language) = &self.language {
            url.push_str("&language=");
            url.push_str(language);
        }

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;

        let recognition = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map_or_else(
                || Recognition::final_text("", 0.0),
                |a| Recognition::final_text(a.transcript.trim(), a.confidence.unwrap_or(1.0)),
            );

        tracing::debug!(
            chars = recognition.text.chars().count(),
            confidence = recognition.confidence,
            "transcription complete"
        );
        Ok(recognition)
    }
}

#[async_trait]
impl SttBackend for HttpSttBackend {
    fn name(&self) -> &'static str {
        match self.provider {
            SttProvider::Whisper => "whisper",
            SttProvider::Deepgram => "deepgram",
        }
    }

    async fn stream(
        &self,
        mut input: mpsc::UnboundedReceiver<SttInput>,
        output: mpsc::Sender<Recognition>,
    ) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(item) = input.recv().await {
            match item {
                SttInput::Audio(frame) => buffer.extend_from_slice(&frame),
                SttInput::Flush => {
                    let recognition = if buffer.is_empty() {
                        Recognition::final_text("", 0.0)
                    } else {
                        self.transcribe(&buffer).await?
                    };
                    buffer.clear();
                    if output.send(recognition).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Backend used when no STT provider is configured
///
/// Fails every utterance at flush time so sessions still get a terminal
/// (empty) transcription for each segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredStt;

#[async_trait]
impl SttBackend for UnconfiguredStt {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn stream(
        &self,
        mut input: mpsc::UnboundedReceiver<SttInput>,
        _output: mpsc::Sender<Recognition>,
    ) -> Result<()> {
        while let Some(item) = input.recv().await {
            if matches!(item, SttInput::Flush) {
                return Err(Error::Stt("no STT provider configured".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let result = HttpSttBackend::new_whisper(
            SecretString::from(String::new()),
            "whisper-1".to_string(),
            16_000,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_yields_empty_final() {
        let backend = HttpSttBackend::new_deepgram(
            SecretString::from("key".to_string()),
            "nova-2".to_string(),
            16_000,
        )
        .unwrap();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(4);
        in_tx.send(SttInput::Flush).unwrap();
        drop(in_tx);

        backend.stream(in_rx, out_tx).await.unwrap();
        let recognition = out_rx.recv().await.unwrap();
        assert!(recognition.is_final);
        assert!(recognition.text.is_empty());
        assert!(recognition.confidence.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unconfigured_fails_at_flush() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::channel(4);
        in_tx.send(SttInput::Audio(vec![0; 960])).unwrap();
        in_tx.send(SttInput::Flush).unwrap();

        let result = UnconfiguredStt.stream(in_rx, out_tx).await;
        assert!(matches!(result, Err(Error::Stt(_))));
    }
}
