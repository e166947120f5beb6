//! Session repository

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::DbPool;
use crate::session::{Session, SessionStatus, SessionStore};
use crate::voice::CalibrationResult;
use crate::{Error, Result};

/// `SQLite`-backed [`SessionStore`]
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    /// Create a new session repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Sessions for a parent, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_parent(&self, parent_id: &str) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE parent_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([parent_id], row_to_raw)?;

        rows.map(|row| row.map_err(Error::from).and_then(RawSession::into_session))
            .collect()
    }
}

const COLUMNS: &str =
    "id, story_id, parent_id, mode, status, story_json, calibration_json, created_at, ended_at";

struct RawSession {
    id: String,
    story_id: String,
    parent_id: String,
    mode: String,
    status: String,
    story_json: String,
    calibration_json: Option<String>,
    created_at: String,
    ended_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        id: row.get(0)?,
        story_id: row.get(1)?,
        parent_id: row.get(2)?,
        mode: row.get(3)?,
        status: row.get(4)?,
        story_json: row.get(5)?,
        calibration_json: row.get(6)?,
        created_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

impl RawSession {
    fn into_session(self) -> Result<Session> {
        let calibration: Option<CalibrationResult> = self
            .calibration_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Session {
            id: self.id,
            story_id: self.story_id,
            parent_id: self.parent_id,
            mode: self.mode.parse()?,
            status: self.status.parse()?,
            story: serde_json::from_str(&self.story_json)?,
            playback_position_ms: 0,
            is_speaking: false,
            current_segment_id: None,
            calibration,
            created_at: parse_datetime(&self.created_at),
            ended_at: self.ended_at.as_deref().map(parse_datetime),
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, session: &Session) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let calibration = session
            .calibration
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO sessions (id, story_id, parent_id, mode, status, story_json, calibration_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.story_id,
                session.parent_id,
                session.mode.as_str(),
                session.status.as_str(),
                serde_json::to_string(&session.story)?,
                calibration,
                session.created_at.to_rfc3339(),
                now,
            ],
        )?;

        tracing::debug!(session_id = %session.id, "session stored");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"),
                [id],
                row_to_raw,
            )
            .optional()?;

        raw.map(RawSession::into_session).transpose()
    }

    fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    fn update_calibration(&self, id: &str, calibration: &CalibrationResult) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sessions SET calibration_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(calibration)?,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if updated == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    fn end(&self, id: &str, status: SessionStatus, ended_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let ended_at = ended_at.to_rfc3339();
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ended_at, id],
        )?;
        if updated == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::StoryContext;
    use crate::db::init_memory;
    use crate::session::{NewSession, SessionMode};

    fn new_session(parent: &str) -> Session {
        Session::new(NewSession {
            story_id: "story-1".to_string(),
            parent_id: parent.to_string(),
            mode: SessionMode::Interactive,
            story: Some(StoryContext {
                title: "小兔子與大野狼".to_string(),
                ..StoryContext::default()
            }),
        })
    }

    #[test]
    fn test_create_and_get() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        let session = new_session("parent-1");
        store.create(&session).unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Calibrating);
        assert_eq!(loaded.mode, SessionMode::Interactive);
        assert_eq!(loaded.story.title, "小兔子與大野狼");
        assert!(loaded.calibration.is_none());
    }

    #[test]
    fn test_get_unknown_is_none() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_status_and_calibration() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        let session = new_session("parent-1");
        store.create(&session).unwrap();

        store
            .update_status(&session.id, SessionStatus::Active)
            .unwrap();
        let calibration = CalibrationResult {
            noise_floor_db: -45.0,
            percentile_90_db: -40.0,
            sample_count: 100,
            calibration_duration_ms: 3000,
        };
        store.update_calibration(&session.id, &calibration).unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.calibration, Some(calibration));
    }

    #[test]
    fn test_update_unknown_fails() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        let result = store.update_status("missing", SessionStatus::Active);
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
    }

    #[test]
    fn test_end_sets_terminal_status() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        let session = new_session("parent-1");
        store.create(&session).unwrap();

        store
            .end(&session.id, SessionStatus::Completed, Utc::now())
            .unwrap();
        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.ended_at.is_some());
    }

    #[test]
    fn test_list_for_parent() {
        let store = SqliteSessionStore::new(init_memory().unwrap());
        store.create(&new_session("parent-1")).unwrap();
        store.create(&new_session("parent-1")).unwrap();
        store.create(&new_session("parent-2")).unwrap();

        assert_eq!(store.list_for_parent("parent-1").unwrap().len(), 2);
        assert_eq!(store.list_for_parent("parent-3").unwrap().len(), 0);
    }
}
