//! Session event fan-out
//!
//! Subscribers are called synchronously, in subscription order, from a
//! snapshot of the list taken at emit time. A subscriber may unsubscribe
//! (itself or others) while an event is being delivered. Subscribers report
//! failure through their `Result`; a failing subscriber is logged and the
//! rest still run. Subscribers must not panic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::types::{SessionMode, SessionStatus};
use crate::Result;
use crate::ai::{AiResponse, TriggerType};
use crate::voice::CalibrationResult;

/// Something that happened in a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created {
        mode: SessionMode,
    },
    Activated,
    Paused,
    Resumed,
    CalibrationStarted {
        duration_ms: u64,
        instructions: String,
    },
    CalibrationCompleted(CalibrationResult),
    SpeechStarted {
        segment_id: String,
        sequence: u32,
    },
    SpeechEnded {
        segment_id: String,
        duration_ms: u64,
    },
    TranscriptionFinal {
        segment_id: String,
        text: String,
        confidence: f32,
    },
    AiProcessingStarted {
        trigger: TriggerType,
    },
    AiResponded(AiResponse),
    ModeSwitched {
        mode: SessionMode,
        status: SessionStatus,
    },
    ContextUpdated,
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    Ended {
        status: SessionStatus,
    },
}

impl SessionEvent {
    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Activated => "activated",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::CalibrationStarted { .. } => "calibration_started",
            Self::CalibrationCompleted(_) => "calibration_completed",
            Self::SpeechStarted { .. } => "speech_started",
            Self::SpeechEnded { .. } => "speech_ended",
            Self::TranscriptionFinal { .. } => "transcription_final",
            Self::AiProcessingStarted { .. } => "ai_processing_started",
            Self::AiResponded(_) => "ai_responded",
            Self::ModeSwitched { .. } => "mode_switched",
            Self::ContextUpdated => "context_updated",
            Self::Error { .. } => "error",
            Self::Ended { .. } => "ended",
        }
    }
}

/// Event callback
pub type EventHandler = Arc<dyn Fn(&SessionEvent) -> Result<()> + Send + Sync>;

/// Handle returned by [`EventHub::subscribe`]
pub type SubscriptionId = u64;

/// Fan-out of session events to subscribers
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, EventHandler)>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all future events
    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, handler));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every current subscriber
    pub fn emit(&self, event: &SessionEvent) {
        let snapshot: Vec<(SubscriptionId, EventHandler)> = self.subscribers.lock().clone();

        for (id, handler) in snapshot {
            if let Err(e) = handler(event) {
                tracing::warn!(subscriber = id, event = event.name(), error = %e, "session event subscriber failed");
            }
        }
    }
}
