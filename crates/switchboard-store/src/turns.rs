use tracing::instrument;

use switchboard_core::ids::SessionId;
use switchboard_core::summarizer::Turn;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Conversation messages, in insertion order per session.
#[derive(Clone)]
pub struct TurnRepo {
    db: Database,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, turn), fields(session_id = %session_id, role = turn.role.as_str()))]
    pub fn append(&self, session_id: &SessionId, turn: &Turn) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO turns (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![session_id.as_str(), turn.role.as_str(), turn.content, turn.created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// First `limit` turns of a session, oldest first.
    pub fn list(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Turn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, created_at FROM turns WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 0, "turns", "role")?;
                out.push(Turn {
                    role: row_helpers::parse_enum(&role, "turns", "role")?,
                    content: row_helpers::get(row, 1, "turns", "content")?,
                    created_at: row_helpers::get(row, 2, "turns", "created_at")?,
                });
            }
            Ok(out)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}
