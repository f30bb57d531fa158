use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use switchboard_core::events::{StreamEvent, Visibility};
use switchboard_core::ids::{EventId, RequestId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A translated event as persisted in the audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub sequence: u32,
    pub visibility: Visibility,
    pub event: StreamEvent,
}

/// Append-only audit log of every translated event, including the ones the
/// client never sees.
#[derive(Clone)]
pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a batch of records in one transaction.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub fn append_all(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO audit_events
                    (id, session_id, request_id, sequence, kind, source_name, source_kind, depth,
                     status, visibility, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for r in records {
                let ev = &r.event;
                stmt.execute(rusqlite::params![
                    ev.event_id.as_str(),
                    r.session_id.as_str(),
                    r.request_id.as_str(),
                    r.sequence,
                    enum_str(&ev.kind)?,
                    ev.source_name,
                    enum_str(&ev.source_kind)?,
                    ev.depth,
                    enum_str(&ev.status)?,
                    enum_str(&r.visibility)?,
                    serde_json::to_string(&ev.payload)?,
                    ev.timestamp.to_rfc3339(),
                ])?;
            }
            Ok(())
        })
    }

    pub fn list_for_request(&self, request_id: &RequestId) -> Result<Vec<AuditRecord>, StoreError> {
        self.query(
            "WHERE request_id = ?1 ORDER BY sequence ASC",
            request_id.as_str(),
            u32::MAX,
        )
    }

    pub fn list_for_session(&self, session_id: &SessionId, limit: u32) -> Result<Vec<AuditRecord>, StoreError> {
        self.query(
            "WHERE session_id = ?1 ORDER BY timestamp ASC, sequence ASC",
            session_id.as_str(),
            limit,
        )
    }

    fn query(&self, clause: &str, key: &str, limit: u32) -> Result<Vec<AuditRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, session_id, request_id, sequence, kind, source_name, source_kind, depth,
                        status, visibility, payload, timestamp
                 FROM audit_events {clause} LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![key, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
            Ok(out)
        })
    }
}

fn enum_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!("expected string enum, got {other}"))),
    }
}

fn parse_serde_enum<T: DeserializeOwned>(raw: String, column: &'static str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.clone())).map_err(|_| StoreError::CorruptRow {
        table: "audit_events",
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<AuditRecord, StoreError> {
    const T: &str = "audit_events";
    let payload: String = row_helpers::get(row, 10, T, "payload")?;
    let timestamp: String = row_helpers::get(row, 11, T, "timestamp")?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::CorruptRow {
            table: T,
            column: "timestamp",
            detail: e.to_string(),
        })?
        .with_timezone(&chrono::Utc);

    Ok(AuditRecord {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        request_id: RequestId::from_raw(row_helpers::get::<String>(row, 2, T, "request_id")?),
        sequence: row_helpers::get(row, 3, T, "sequence")?,
        visibility: parse_serde_enum(row_helpers::get(row, 9, T, "visibility")?, "visibility")?,
        event: StreamEvent {
            event_id: EventId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
            timestamp,
            source_name: row_helpers::get(row, 5, T, "source_name")?,
            source_kind: parse_serde_enum(row_helpers::get(row, 6, T, "source_kind")?, "source_kind")?,
            depth: row_helpers::get(row, 7, T, "depth")?,
            kind: parse_serde_enum(row_helpers::get(row, 4, T, "kind")?, "kind")?,
            payload: row_helpers::parse_json(&payload, T, "payload")?,
            status: parse_serde_enum(row_helpers::get(row, 8, T, "status")?, "status")?,
        },
    })
}
