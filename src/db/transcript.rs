//! Transcript repository

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::DbPool;
use crate::ai::Turn;
use crate::session::{TranscriptRecord, TranscriptSink};
use crate::{Error, Result};

/// A transcript as stored
#[derive(Debug, Clone)]
pub struct StoredTranscript {
    pub id: String,
    pub session_id: String,
    pub turns: Vec<Turn>,
    pub turn_count: usize,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// `SQLite`-backed [`TranscriptSink`]
#[derive(Clone)]
pub struct SqliteTranscriptStore {
    pool: DbPool,
}

impl SqliteTranscriptStore {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load a transcript by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<StoredTranscript>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT id, session_id, turns_json, turn_count, total_duration_ms, created_at
                 FROM transcripts WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, session_id, turns_json, turn_count, total_duration_ms, created_at)| {
            Ok(StoredTranscript {
                id,
                session_id,
                turns: serde_json::from_str(&turns_json)?,
                turn_count: usize::try_from(turn_count).unwrap_or(0),
                total_duration_ms: u64::try_from(total_duration_ms).unwrap_or(0),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
            })
        })
        .transpose()
    }
}

impl TranscriptSink for SqliteTranscriptStore {
    fn save(&self, transcript: &TranscriptRecord) -> Result<String> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO transcripts (id, session_id, story_id, parent_id, turns_json, turn_count, total_duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                transcript.session_id,
                transcript.story_id,
                transcript.parent_id,
                serde_json::to_string(&transcript.turns)?,
                i64::try_from(transcript.turn_count()).unwrap_or(i64::MAX),
                i64::try_from(transcript.total_duration_ms).unwrap_or(i64::MAX),
                transcript.created_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!(transcript_id = %id, session_id = %transcript.session_id, "transcript saved");
        Ok(id)
    }
}
