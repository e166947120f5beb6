//! Persistence seams used by sessions

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Session, SessionStatus};
use crate::Result;
use crate::ai::Turn;
use crate::voice::CalibrationResult;

/// Session repository
pub trait SessionStore: Send + Sync {
    /// Persist a new session
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be stored
    fn create(&self, session: &Session) -> Result<()>;

    /// Look up a session by id
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails
    fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Record a status change
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    fn update_status(&self, id: &str, status: SessionStatus) -> Result<()>;

    /// Record the latest calibration
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    fn update_calibration(&self, id: &str, calibration: &CalibrationResult) -> Result<()>;

    /// Mark a session finished with its terminal status
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    fn end(&self, id: &str, status: SessionStatus, ended_at: DateTime<Utc>) -> Result<()>;
}

/// Transcript of a finished session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub session_id: String,
    pub story_id: String,
    pub parent_id: String,
    pub turns: Vec<Turn>,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl TranscriptRecord {
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

/// Destination for finished transcripts
pub trait TranscriptSink: Send + Sync {
    /// Store a transcript, returning its id
    ///
    /// # Errors
    ///
    /// Returns error if the transcript cannot be stored
    fn save(&self, transcript: &TranscriptRecord) -> Result<String>;
}
