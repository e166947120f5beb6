//! Wire messages for the interaction socket
//!
//! Text frames carry JSON objects tagged by `type`. Client messages also
//! carry an ISO-8601 `timestamp`, which the server ignores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{ContextUpdate, SessionEvent, SessionStatus, SessionSummary};

/// Every client message type the gateway understands
pub const CLIENT_MESSAGE_TYPES: [&str; 12] = [
    "start_listening",
    "stop_listening",
    "speech_started",
    "speech_ended",
    "interrupt_ai",
    "pause_session",
    "resume_session",
    "end_session",
    "update_context",
    "ping",
    "start_calibration",
    "complete_calibration",
];

/// Control message sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    StartListening,
    StopListening,
    SpeechStarted,
    SpeechEnded {
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    InterruptAi,
    PauseSession,
    ResumeSession,
    EndSession,
    UpdateContext(ContextUpdate),
    Ping,
    StartCalibration,
    CompleteCalibration,
}

/// Why a text frame could not be turned into a [`ClientMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
}

impl ProtocolError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Parse a text frame
///
/// # Errors
///
/// `invalid_json` for text that is not JSON, `invalid_message` for JSON
/// without a string `type` or with malformed fields, and
/// `unknown_message_type` for a type outside [`CLIENT_MESSAGE_TYPES`]
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::new("invalid_json", format!("malformed JSON: {e}")))?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(ProtocolError::new(
            "invalid_message",
            "message must be an object with a string `type`",
        ));
    };
    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(ProtocolError::new(
            "unknown_message_type",
            format!("unknown message type: {kind}"),
        ));
    }

    let kind = kind.to_string();
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::new("invalid_message", format!("invalid {kind} message: {e}")))
}

/// Event sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ConnectionEstablished {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },
    TranscriptionFinal {
        text: String,
        confidence: f32,
        segment_id: String,
        timestamp: DateTime<Utc>,
    },
    AiProcessingStarted {
        timestamp: DateTime<Utc>,
    },
    AiResponse {
        response_id: String,
        text: String,
        was_redirected: bool,
        is_fallback: bool,
        processing_time_ms: u64,
        timestamp: DateTime<Utc>,
    },
    AiResponseCompleted {
        response_id: String,
        was_interrupted: bool,
        timestamp: DateTime<Utc>,
    },
    SessionStatusChanged {
        status: SessionStatus,
        timestamp: DateTime<Utc>,
    },
    SessionEnded {
        transcript_id: Option<String>,
        turn_count: usize,
        total_duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    CalibrationStarted {
        duration_ms: u64,
        instructions: String,
        timestamp: DateTime<Utc>,
    },
    CalibrationCompleted {
        noise_floor_db: f32,
        percentile90: f32,
        sample_count: usize,
        calibration_duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ContextUpdated {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// Error event stamped now
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn session_ended(summary: &SessionSummary) -> Self {
        Self::SessionEnded {
            transcript_id: summary.transcript_id.clone(),
            turn_count: summary.turn_count,
            total_duration_ms: summary.total_duration_ms,
            timestamp: Utc::now(),
        }
    }

    /// Wire `type` of this event
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::Error { .. } => "error",
            Self::TranscriptionFinal { .. } => "transcription_final",
            Self::AiProcessingStarted { .. } => "ai_processing_started",
            Self::AiResponse { .. } => "ai_response",
            Self::AiResponseCompleted { .. } => "ai_response_completed",
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::SessionEnded { .. } => "session_ended",
            Self::CalibrationStarted { .. } => "calibration_started",
            Self::CalibrationCompleted { .. } => "calibration_completed",
            Self::ContextUpdated { .. } => "context_updated",
            Self::Pong { .. } => "pong",
        }
    }

    /// Client-facing form of a session event
    ///
    /// Creation and speech boundaries stay internal.
    #[must_use]
    pub fn from_session_event(event: &SessionEvent) -> Option<Self> {
        let timestamp = Utc::now();
        let status = |status| Self::SessionStatusChanged { status, timestamp };

        let mapped = match event {
            SessionEvent::Created { .. }
            | SessionEvent::SpeechStarted { .. }
            | SessionEvent::SpeechEnded { .. } => return None,
            SessionEvent::Activated | SessionEvent::Resumed => status(SessionStatus::Active),
            SessionEvent::Paused => status(SessionStatus::Paused),
            SessionEvent::ModeSwitched { status: s, .. } | SessionEvent::Ended { status: s } => {
                status(*s)
            }
            SessionEvent::CalibrationStarted {
                duration_ms,
                instructions,
            } => Self::CalibrationStarted {
                duration_ms: *duration_ms,
                instructions: instructions.clone(),
                timestamp,
            },
            SessionEvent::CalibrationCompleted(result) => Self::CalibrationCompleted {
                noise_floor_db: result.noise_floor_db,
                percentile90: result.percentile_90_db,
                sample_count: result.sample_count,
                calibration_duration_ms: result.calibration_duration_ms,
                timestamp,
            },
            SessionEvent::TranscriptionFinal {
                segment_id,
                text,
                confidence,
            } => Self::TranscriptionFinal {
                text: text.clone(),
                confidence: *confidence,
                segment_id: segment_id.clone(),
                timestamp,
            },
            SessionEvent::AiProcessingStarted { .. } => Self::AiProcessingStarted { timestamp },
            SessionEvent::AiResponded(response) => Self::AiResponse {
                response_id: response.id.clone(),
                text: response.text.clone(),
                was_redirected: response.was_redirected,
                is_fallback: response.is_fallback,
                processing_time_ms: response.latency_ms,
                timestamp,
            },
            SessionEvent::ContextUpdated => Self::ContextUpdated { timestamp },
            SessionEvent::Error {
                code,
                message,
                recoverable,
            } => Self::Error {
                code: code.clone(),
                message: message.clone(),
                recoverable: *recoverable,
                timestamp,
            },
        };
        Some(mapped)
    }
}
