use chrono::Utc;
use rusqlite::types::ToSql;
use tracing::instrument;

use switchboard_core::ids::UserId;
use switchboard_core::memory::{MemoryItem, MAX_MEMORY_LIMIT};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone)]
pub struct MemoryRepo {
    db: Database,
}

impl MemoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a memory with lower-cased topics.
    pub fn add(&self, user_id: &UserId, memory: &str, topics: &[&str]) -> Result<MemoryItem, StoreError> {
        let item = MemoryItem {
            memory_id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.as_str().to_owned(),
            memory: memory.to_owned(),
            topics: topics.iter().map(|t| t.trim().to_lowercase()).collect(),
            updated_at: Utc::now().to_rfc3339(),
        };
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO memories (id, user_id, memory, topics, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    item.memory_id,
                    item.user_id,
                    item.memory,
                    serde_json::to_string(&item.topics)?,
                    item.updated_at,
                ],
            )?;
            for topic in &item.topics {
                tx.execute(
                    "INSERT OR IGNORE INTO memory_topics (memory_id, topic) VALUES (?1, ?2)",
                    rusqlite::params![item.memory_id, topic],
                )?;
            }
            Ok(())
        })?;
        Ok(item)
    }

    /// Most recent memories of `user_id` tagged with any of `topics`.
    /// An empty topic list matches every memory. `limit` is capped.
    #[instrument(skip(self, topics), fields(user_id = %user_id, topics = topics.len(), limit))]
    pub fn search(&self, topics: &[String], user_id: &UserId, limit: usize) -> Result<Vec<MemoryItem>, StoreError> {
        let limit = limit.min(MAX_MEMORY_LIMIT) as i64;
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.db.with_conn(|conn| {
            let uid = user_id.as_str();
            let mut params: Vec<&dyn ToSql> = vec![&uid];
            let sql = if topics.is_empty() {
                "SELECT m.id, m.user_id, m.memory, m.topics, m.updated_at FROM memories m
                 WHERE m.user_id = ?1 ORDER BY m.updated_at DESC, m.id DESC LIMIT ?2"
                    .to_owned()
            } else {
                let placeholders: Vec<String> = (0..topics.len()).map(|i| format!("?{}", i + 3)).collect();
                format!(
                    "SELECT m.id, m.user_id, m.memory, m.topics, m.updated_at FROM memories m
                     WHERE m.user_id = ?1 AND EXISTS (
                        SELECT 1 FROM memory_topics t WHERE t.memory_id = m.id AND t.topic IN ({})
                     )
                     ORDER BY m.updated_at DESC, m.id DESC LIMIT ?2",
                    placeholders.join(", ")
                )
            };
            params.push(&limit);
            for topic in topics {
                params.push(topic);
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_memory(row)?);
            }
            Ok(out)
        })
    }

    pub fn count(&self, user_id: &UserId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> Result<MemoryItem, StoreError> {
    const T: &str = "memories";
    let topics: String = row_helpers::get(row, 3, T, "topics")?;
    Ok(MemoryItem {
        memory_id: row_helpers::get(row, 0, T, "id")?,
        user_id: row_helpers::get(row, 1, T, "user_id")?,
        memory: row_helpers::get(row, 2, T, "memory")?,
        topics: row_helpers::parse_json(&topics, T, "topics")?,
        updated_at: row_helpers::get(row, 4, T, "updated_at")?,
    })
}
