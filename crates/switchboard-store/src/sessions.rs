use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use switchboard_core::ids::{SessionId, UserId};
use switchboard_core::session::SessionState;
use switchboard_core::Mode;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SESSION_COLUMNS: &str =
    "id, user_id, mode, name, naming_attempts, created_at, last_active_at";

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new session. Fails with `Conflict` if the id is taken.
    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    pub fn create(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionState, StoreError> {
        let state = SessionState::new(session_id.clone(), user_id.clone());
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (id, user_id, mode, naming_attempts, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                rusqlite::params![
                    state.session_id.as_str(),
                    state.user_id.as_str(),
                    state.mode.as_str(),
                    state.created_at,
                    state.last_active_at,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("session {session_id} already exists")));
            }
            Ok(state)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionState, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    pub fn find(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Bump `last_active_at`.
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id, mode = %mode))]
    pub fn update_mode(&self, id: &SessionId, mode: Mode) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET mode = ?1, last_active_at = ?2 WHERE id = ?3",
                rusqlite::params![mode.as_str(), Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Commit a title if the session has none yet. Returns whether it was written.
    #[instrument(skip(self, name), fields(session_id = %id))]
    pub fn set_name_once(&self, id: &SessionId, name: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET name = ?1 WHERE id = ?2 AND name IS NULL",
                rusqlite::params![name, id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Record a failed naming attempt and return the new attempt count.
    pub fn record_naming_failure(&self, id: &SessionId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "UPDATE sessions SET naming_attempts = naming_attempts + 1 WHERE id = ?1
                 RETURNING naming_attempts",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
        })
    }

    /// Sessions for a user, most recently active first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list(&self, user_id: &UserId, limit: u32, offset: u32) -> Result<Vec<SessionState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1
                 ORDER BY last_active_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionState, StoreError> {
    const T: &str = "sessions";
    let mode: String = row_helpers::get(row, 2, T, "mode")?;
    Ok(SessionState {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, T, "user_id")?),
        mode: row_helpers::parse_enum(&mode, T, "mode")?,
        name: row_helpers::get_opt(row, 3, T, "name")?,
        naming_attempts: row_helpers::get(row, 4, T, "naming_attempts")?,
        created_at: row_helpers::get(row, 5, T, "created_at")?,
        last_active_at: row_helpers::get(row, 6, T, "last_active_at")?,
    })
}
