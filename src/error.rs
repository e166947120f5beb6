//! Error types for the story voice gateway

use thiserror::Error;

use crate::session::SessionStatus;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the story voice gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio decoding or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// A PCM frame did not have the configured byte length
    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// A transcription stream is already open on this coordinator
    #[error("transcription already streaming for session {0}")]
    AlreadyStreaming(String),

    /// No transcription stream is open
    #[error("no transcription stream is open")]
    NotStreaming,

    /// LLM backend error that escaped the responder
    #[error("LLM error: {0}")]
    Llm(String),

    /// Illegal session state transition
    #[error("cannot {action} while session is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    /// Session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Protocol message could not be handled
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Stable wire code reported in `error` events
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Audio(_) => "audio_error",
            Self::FrameSize { .. } => "invalid_frame",
            Self::Stt(_) | Self::AlreadyStreaming(_) | Self::NotStreaming => "transcription_error",
            Self::Llm(_) => "ai_error",
            Self::InvalidTransition { .. } => "invalid_state_transition",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Auth(_) => "unauthorized",
            Self::Protocol(_) => "invalid_message",
            Self::Database(_) | Self::Sqlite(_) => "storage_error",
            Self::Io(_) | Self::Http(_) | Self::Serialization(_) | Self::Toml(_) => {
                "internal_error"
            }
        }
    }
}
