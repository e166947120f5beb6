//! Session data model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::ai::StoryContext;
use crate::voice::CalibrationResult;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Calibrating,
    Active,
    Paused,
    Completed,
    Error,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Calibrating => "calibrating",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether no further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calibrating" => Ok(Self::Calibrating),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(Error::Database(format!("unknown session status: {other}"))),
        }
    }
}

/// Whether the child can talk back during the story
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Interactive,
    Passive,
}

impl SessionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Passive => "passive",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "passive" => Ok(Self::Passive),
            other => Err(Error::Database(format!("unknown session mode: {other}"))),
        }
    }
}

/// A storytelling session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub story_id: String,
    pub parent_id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub story: StoryContext,
    pub playback_position_ms: u64,
    pub is_speaking: bool,
    pub current_segment_id: Option<String>,
    pub calibration: Option<CalibrationResult>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A fresh session in its initial status for `mode`
    #[must_use]
    pub fn new(request: NewSession) -> Self {
        let status = match request.mode {
            SessionMode::Interactive => SessionStatus::Calibrating,
            SessionMode::Passive => SessionStatus::Active,
        };
        let mut story = request.story.unwrap_or_default();
        if story.story_id.is_none() {
            story.story_id = Some(request.story_id.clone());
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            story_id: request.story_id,
            parent_id: request.parent_id,
            mode: request.mode,
            status,
            story,
            playback_position_ms: 0,
            is_speaking: false,
            current_segment_id: None,
            calibration: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Request to create a session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub story_id: String,
    pub parent_id: String,
    pub mode: SessionMode,
    #[serde(default)]
    pub story: Option<StoryContext>,
}

/// One contiguous child utterance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSegment {
    pub id: String,
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transcript: Option<String>,
    pub confidence: Option<f32>,
}

impl VoiceSegment {
    /// Segment length, once it has ended
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        let ended = self.ended_at?;
        u64::try_from((ended - self.started_at).num_milliseconds()).ok()
    }
}

/// Result of finalizing a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub transcript_id: Option<String>,
    pub turn_count: usize,
    pub total_duration_ms: u64,
}

/// Partial story update from the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdate {
    pub story_id: Option<String>,
    pub story_title: Option<String>,
    pub story_synopsis: Option<String>,
    pub characters: Option<Vec<String>>,
    pub current_scene: Option<String>,
    pub playback_position_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: SessionMode) -> NewSession {
        NewSession {
            story_id: "story-1".to_string(),
            parent_id: "parent-1".to_string(),
            mode,
            story: None,
        }
    }

    #[test]
    fn initial_status_depends_on_mode() {
        assert_eq!(
            Session::new(request(SessionMode::Interactive)).status,
            SessionStatus::Calibrating
        );
        assert_eq!(
            Session::new(request(SessionMode::Passive)).status,
            SessionStatus::Active
        );
    }

    #[test]
    fn story_id_is_carried_into_context() {
        let session = Session::new(request(SessionMode::Passive));
        assert_eq!(session.story.story_id.as_deref(), Some("story-1"));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Calibrating,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn segment_duration() {
        let started_at = Utc::now();
        let segment = VoiceSegment {
            id: "s".to_string(),
            sequence: 1,
            started_at,
            ended_at: Some(started_at + chrono::Duration::milliseconds(1500)),
            transcript: None,
            confidence: None,
        };
        assert_eq!(segment.duration_ms(), Some(1500));
    }
}
