use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, SessionId};
use crate::mode::Mode;

/// One event as produced by the execution engine.
///
/// Engines emit flat JSON objects with an `event` label plus source fields
/// (`team_name`, `agent_name`, `run_id`, `parent_run_id`) and kind-specific
/// fields (`content`, `tool`). Nothing here is trusted; the translator
/// decides what is well formed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub Value);

impl RawEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn label(&self) -> Option<&str> {
        self.0.get("event").and_then(Value::as_str)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Team name if present, otherwise agent name.
    pub fn source_name(&self) -> Option<&str> {
        self.str_field("team_name").or_else(|| self.str_field("agent_name"))
    }

    /// Tool fields live either in a nested `tool` object or at the top level.
    pub fn tool_field(&self, key: &str) -> Option<&Value> {
        self.0
            .get("tool")
            .and_then(|t| t.get(key))
            .filter(|v| !v.is_null())
            .or_else(|| self.field(key))
    }

    pub fn tool_str(&self, key: &str) -> Option<&str> {
        self.tool_field(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Main,
    Team,
    Agent,
    Tool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Content,
    ToolCall,
    Reasoning,
    Completed,
    /// Token counts and cost for a completed run.
    Usage,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Content => "content",
            Self::ToolCall => "tool_call",
            Self::Reasoning => "reasoning",
            Self::Completed => "completed",
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Running,
    Completed,
    Failed,
    /// Synthesized turn for a source that produced output before it started.
    Placeholder,
}

/// Whether a translated event reaches the client or only the audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Client,
    AuditOnly,
}

/// Normalized, depth-annotated event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub source_name: String,
    pub source_kind: SourceKind,
    pub depth: u32,
    pub kind: EventKind,
    pub payload: Value,
    pub status: EventStatus,
}

/// Events sent to the client over SSE, in order. `Done` is always last.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Session {
        session_id: SessionId,
        mode: Mode,
        request_id: String,
    },
    Stream(StreamEvent),
    /// A user-visible tool was used.
    Capability {
        event_id: EventId,
        tool_name: String,
        source_name: String,
        depth: u32,
    },
    Notice {
        code: String,
        message: String,
    },
    Retry {
        attempt: u32,
        max_retries: u32,
        delay_secs: u64,
        message: String,
    },
    Error {
        error_type: String,
        message: String,
        retryable: bool,
    },
    Done {
        session_id: SessionId,
        cancelled: bool,
    },
}

impl ClientEvent {
    /// SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Stream(ev) => ev.kind.as_str(),
            Self::Capability { .. } => "capability",
            Self::Notice { .. } => "notice",
            Self::Retry { .. } => "retry",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn notice(code: &str, message: impl Into<String>) -> Self {
        Self::Notice {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_event_accessors() {
        let raw = RawEvent::new(json!({
            "event": "TeamToolCallStarted",
            "team_name": "Research Team",
            "agent_name": "",
            "tool": {"tool_name": "think", "tool_call_id": "call_1"}
        }));
        assert_eq!(raw.label(), Some("TeamToolCallStarted"));
        assert_eq!(raw.source_name(), Some("Research Team"));
        assert_eq!(raw.tool_str("tool_name"), Some("think"));
        assert_eq!(raw.tool_str("tool_call_id"), Some("call_1"));
    }

    #[test]
    fn raw_event_top_level_tool_fields() {
        let raw = RawEvent::new(json!({"event": "ToolCallStarted", "tool_name": "exa_search"}));
        assert_eq!(raw.tool_str("tool_name"), Some("exa_search"));
        assert_eq!(raw.source_name(), None);
    }

    #[test]
    fn client_event_type_strings() {
        let ev = ClientEvent::notice("delegation_frozen", "still working");
        assert_eq!(ev.event_type(), "notice");
        let done = ClientEvent::Done {
            session_id: SessionId::from_raw("sess_1"),
            cancelled: false,
        };
        assert!(done.is_terminal());
        assert_eq!(done.event_type(), "done");
    }

    #[test]
    fn stream_variant_uses_kind_as_type() {
        let ev = ClientEvent::Stream(StreamEvent {
            event_id: EventId::from_raw("evt_1"),
            timestamp: Utc::now(),
            source_name: "main".into(),
            source_kind: SourceKind::Main,
            depth: 0,
            kind: EventKind::Content,
            payload: json!({"content": "hi"}),
            status: EventStatus::Running,
        });
        assert_eq!(ev.event_type(), "content");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "stream");
        assert_eq!(json["source_kind"], "main");
        assert_eq!(json["payload"]["content"], "hi");
    }

    #[test]
    fn error_serializes_flat() {
        let ev = ClientEvent::Error {
            error_type: "timeout".into(),
            message: "took too long".into(),
            retryable: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error_type"], "timeout");
    }
}
