//! Raw engine events to ordered, depth-annotated stream events.
//!
//! Engines label sources loosely: a team member may arrive as a bare
//! `RunStarted` with only an `agent_name`. Depth is rebuilt from a delegation
//! tree fed by run ids, delegation tool calls, the configured team layout and,
//! as a last resort, whichever delegate is currently running.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use switchboard_core::events::{EventKind, EventStatus, RawEvent, SourceKind, StreamEvent, Visibility};
use switchboard_core::ids::EventId;
use switchboard_core::tools::{MemberKind, ToolCategory, ToolSet};
use switchboard_core::usage::{TokenPricing, TokenUsage};

use crate::error::StreamParseError;
use crate::monitor::{normalize, DELEGATION_TOOLS};

/// Team plumbing the client never sees as a capability.
const COORDINATION_TOOLS: &[&str] = &[
    "delegate_task_to_member",
    "delegate_task_to_members",
    "transfer_task_to_member",
    "forward_task_to_member",
    "get_member_information",
    "set_shared_context",
    "update_team_memory",
];
const REASONING_TOOLS: &[&str] = &["think", "analyze"];
const DEFAULT_ROOT: &str = "assistant";
/// Fallback placement never nests deeper than team member.
const MAX_INFERRED_DEPTH: u32 = 2;

/// One translated event plus routing information.
#[derive(Clone, Debug, PartialEq)]
pub struct TranslatedEvent {
    pub event: StreamEvent,
    pub visibility: Visibility,
    /// Set on the start of a client-visible tool call.
    pub capability: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RawKind {
    Started,
    Content,
    ToolStarted,
    ToolCompleted,
    Reasoning,
    Completed,
    Error,
}

fn classify(label: &str) -> Option<RawKind> {
    let base = label.strip_prefix("Team").unwrap_or(label);
    Some(match base {
        "RunStarted" => RawKind::Started,
        "RunContent" | "RunResponse" | "RunResponseContent" | "RunIntermediateContent" => RawKind::Content,
        "ToolCallStarted" => RawKind::ToolStarted,
        "ToolCallCompleted" | "ToolCallError" => RawKind::ToolCompleted,
        "ReasoningStep" => RawKind::Reasoning,
        "RunCompleted" => RawKind::Completed,
        "RunError" | "RunCancelled" => RawKind::Error,
        _ => return None,
    })
}

struct Node {
    name: String,
    depth: u32,
    kind: SourceKind,
}

struct OpenCall {
    event_id: EventId,
    source: String,
    kind: EventKind,
    tool_name: String,
    args: Value,
    visibility: Visibility,
}

pub struct EventStreamTranslator {
    tools: ToolSet,
    /// Normalized delegate name -> (member kind, normalized parent).
    members: HashMap<String, (Option<MemberKind>, Option<String>)>,
    nodes: HashMap<String, Node>,
    root: Option<String>,
    /// Sources that started and have not completed, innermost last.
    active: Vec<String>,
    /// Sources that have had a `Started`, real or placeholder.
    seen: HashSet<String>,
    runs: HashMap<String, String>,
    /// Member named in a delegation tool call -> the caller.
    pending_members: HashMap<String, String>,
    calls: HashMap<String, OpenCall>,
    last_timestamp: Option<DateTime<Utc>>,
    pricing: TokenPricing,
}

impl EventStreamTranslator {
    pub fn new(tools: &ToolSet) -> Self {
        let members = tools
            .delegates()
            .map(|t| (normalize(&t.name), (t.member_kind, t.parent.as_deref().map(normalize))))
            .collect();
        Self {
            tools: tools.clone(),
            members,
            nodes: HashMap::new(),
            root: None,
            active: Vec::new(),
            seen: HashSet::new(),
            runs: HashMap::new(),
            pending_members: HashMap::new(),
            calls: HashMap::new(),
            last_timestamp: None,
            pricing: TokenPricing::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: TokenPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn translate(&mut self, raw: &RawEvent) -> Result<Vec<TranslatedEvent>, StreamParseError> {
        if !raw.0.is_object() {
            return Err(StreamParseError::NotAnObject);
        }
        let label = raw.label().ok_or(StreamParseError::MissingLabel)?;
        let kind = classify(label).ok_or_else(|| StreamParseError::Unrecognized(label.to_string()))?;
        let team_label = label.starts_with("Team") || raw.str_field("team_name").is_some();

        let name = raw
            .source_name()
            .map(str::to_owned)
            .or_else(|| self.root_name())
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());

        let mut out = Vec::new();
        let key = self.place(&name, raw, team_label);
        if let Some(run_id) = raw.str_field("run_id") {
            self.runs.insert(run_id.to_string(), key.clone());
        }
        if kind != RawKind::Started && self.seen.insert(key.clone()) {
            self.active.push(key.clone());
            out.push(self.emit(&key, EventKind::Started, EventStatus::Placeholder, json!({}), Visibility::Client));
        }

        match kind {
            RawKind::Started => {
                self.seen.insert(key.clone());
                if !self.active.contains(&key) {
                    self.active.push(key.clone());
                }
                let payload = optional_fields(raw, &["run_id", "model"]);
                out.push(self.emit(&key, EventKind::Started, EventStatus::Running, payload, Visibility::Client));
            }
            RawKind::Content => {
                if let Some(text) = text_of(raw.field("content")) {
                    let payload = json!({ "content": text });
                    out.push(self.emit(&key, EventKind::Content, EventStatus::Running, payload, Visibility::Client));
                }
            }
            RawKind::Reasoning => {
                let text = text_of(raw.field("reasoning_content")).or_else(|| text_of(raw.field("content")));
                if let Some(text) = text {
                    let payload = json!({ "content": text });
                    out.push(self.emit(&key, EventKind::Reasoning, EventStatus::Running, payload, Visibility::Client));
                }
            }
            RawKind::ToolStarted => out.push(self.tool_started(&key, raw, label)?),
            RawKind::ToolCompleted => out.push(self.tool_completed(&key, raw, label)?),
            RawKind::Completed => {
                self.active.retain(|k| k != &key);
                let mut payload = Map::new();
                if let Some(text) = text_of(raw.field("content")) {
                    payload.insert("content".into(), Value::String(text));
                }
                let usage = raw.field("metrics").and_then(|metrics| {
                    payload.insert("metrics".into(), metrics.clone());
                    TokenUsage::from_metrics(metrics)
                });
                out.push(self.emit(
                    &key,
                    EventKind::Completed,
                    EventStatus::Completed,
                    Value::Object(payload),
                    Visibility::Client,
                ));
                if let Some(usage) = usage {
                    let cost = usage.cost(&self.pricing);
                    let payload = json!({ "usage": usage, "cost": cost });
                    out.push(self.emit(&key, EventKind::Usage, EventStatus::Completed, payload, Visibility::Client));
                }
            }
            RawKind::Error => {
                self.active.retain(|k| k != &key);
                let message = text_of(raw.field("content"))
                    .or_else(|| text_of(raw.field("error")))
                    .unwrap_or_else(|| label.to_string());
                let payload = json!({ "message": message });
                out.push(self.emit(&key, EventKind::Error, EventStatus::Failed, payload, Visibility::Client));
            }
        }
        Ok(out)
    }

    fn root_name(&self) -> Option<String> {
        self.root
            .as_ref()
            .and_then(|k| self.nodes.get(k))
            .map(|n| n.name.clone())
    }

    /// Find or create the tree node for a source and return its key.
    fn place(&mut self, name: &str, raw: &RawEvent, team_label: bool) -> String {
        let key = normalize(name);
        if self.nodes.contains_key(&key) {
            return key;
        }

        let (depth, kind) = if self.root.is_none() {
            self.root = Some(key.clone());
            (0, SourceKind::Main)
        } else {
            let parent_depth = self.parent_depth(&key, raw);
            let kind = match self.members.get(&key).and_then(|(k, _)| *k) {
                Some(MemberKind::Team) => SourceKind::Team,
                Some(MemberKind::Agent) => SourceKind::Agent,
                None if team_label => SourceKind::Team,
                None => SourceKind::Agent,
            };
            (parent_depth + 1, kind)
        };

        self.nodes.insert(
            key.clone(),
            Node {
                name: name.to_string(),
                depth,
                kind,
            },
        );
        key
    }

    fn parent_depth(&self, key: &str, raw: &RawEvent) -> u32 {
        let depth_of = |k: &str| self.nodes.get(k).map(|n| n.depth);

        if let Some(parent) = raw.str_field("parent_run_id").and_then(|r| self.runs.get(r)) {
            if let Some(d) = depth_of(parent.as_str()) {
                return d;
            }
        }
        if let Some(d) = self.pending_members.get(key).and_then(|caller| depth_of(caller.as_str())) {
            return d;
        }
        if let Some((_, Some(team))) = self.members.get(key) {
            return depth_of(team.as_str()).unwrap_or(1);
        }
        self.active
            .iter()
            .rev()
            .filter_map(|k| depth_of(k.as_str()))
            .find(|d| *d < MAX_INFERRED_DEPTH)
            .unwrap_or(0)
    }

    fn tool_started(&mut self, key: &str, raw: &RawEvent, label: &str) -> Result<TranslatedEvent, StreamParseError> {
        let tool_name = raw.tool_str("tool_name").ok_or_else(|| StreamParseError::MissingField {
            label: label.to_string(),
            field: "tool_name",
        })?;
        let args = raw.tool_field("tool_args").cloned().unwrap_or_else(|| json!({}));

        if DELEGATION_TOOLS.contains(&tool_name) {
            let member = args
                .get("member_id")
                .or_else(|| args.get("member_name"))
                .and_then(Value::as_str);
            if let Some(member) = member {
                self.pending_members.insert(normalize(member), key.to_string());
            }
        }

        let kind = if self.is_reasoning_tool(tool_name) {
            EventKind::Reasoning
        } else {
            EventKind::ToolCall
        };
        let visibility = if self.is_coordination_tool(tool_name) {
            Visibility::AuditOnly
        } else {
            Visibility::Client
        };

        let call_id = raw
            .tool_str("tool_call_id")
            .map(str::to_owned)
            .unwrap_or_else(|| EventId::new().to_string());
        let mut payload = json!({
            "tool_name": tool_name,
            "tool_call_id": call_id,
            "args": args,
        });
        if kind == EventKind::Reasoning {
            if let Some(thought) = thought_of(&args) {
                payload["thought"] = Value::String(thought);
            }
        }

        let mut translated = self.emit(key, kind, EventStatus::Running, payload, visibility);
        if visibility == Visibility::Client && kind == EventKind::ToolCall {
            translated.capability = Some(tool_name.to_string());
        }
        self.calls.insert(
            call_id,
            OpenCall {
                event_id: translated.event.event_id.clone(),
                source: key.to_string(),
                kind,
                tool_name: tool_name.to_string(),
                args,
                visibility,
            },
        );
        Ok(translated)
    }

    fn tool_completed(&mut self, key: &str, raw: &RawEvent, label: &str) -> Result<TranslatedEvent, StreamParseError> {
        let call_id = raw.tool_str("tool_call_id");
        let open = call_id.and_then(|id| self.calls.remove(id));

        let failed = raw.tool_field("tool_call_error").and_then(Value::as_bool).unwrap_or(false)
            || label.ends_with("ToolCallError");
        let result = raw.tool_field("result").cloned();
        let error = text_of(raw.tool_field("error")).or_else(|| {
            failed.then(|| text_of(result.as_ref()).unwrap_or_else(|| "tool call failed".to_string()))
        });
        let status = if error.is_some() { EventStatus::Failed } else { EventStatus::Completed };

        match open {
            Some(open) => {
                let mut payload = json!({
                    "tool_name": open.tool_name,
                    "tool_call_id": call_id,
                    "args": open.args,
                    "result": result,
                    "error": error,
                });
                if open.kind == EventKind::Reasoning {
                    if let Some(thought) = thought_of(&payload["args"]) {
                        payload["thought"] = Value::String(thought);
                    }
                }
                let timestamp = self.next_timestamp();
                let node = self.nodes.get(&open.source);
                Ok(TranslatedEvent {
                    event: StreamEvent {
                        event_id: open.event_id,
                        timestamp,
                        source_name: node.map(|n| n.name.clone()).unwrap_or_default(),
                        source_kind: node.map_or(SourceKind::Agent, |n| n.kind),
                        depth: node.map_or(0, |n| n.depth),
                        kind: open.kind,
                        payload,
                        status,
                    },
                    visibility: open.visibility,
                    capability: None,
                })
            }
            None => {
                let tool_name = raw.tool_str("tool_name").ok_or_else(|| StreamParseError::MissingField {
                    label: label.to_string(),
                    field: "tool_name",
                })?;
                let visibility = if self.is_coordination_tool(tool_name) {
                    Visibility::AuditOnly
                } else {
                    Visibility::Client
                };
                let payload = json!({
                    "tool_name": tool_name,
                    "tool_call_id": call_id,
                    "result": result,
                    "error": error,
                    "orphan": true,
                });
                Ok(self.emit(key, EventKind::ToolCall, EventStatus::Placeholder, payload, visibility))
            }
        }
    }

    fn is_reasoning_tool(&self, name: &str) -> bool {
        REASONING_TOOLS.contains(&name)
            || self.tools.get(name).is_some_and(|t| t.category == ToolCategory::Reasoning)
    }

    fn is_coordination_tool(&self, name: &str) -> bool {
        COORDINATION_TOOLS.contains(&name)
            || self.tools.get(name).is_some_and(|t| t.category == ToolCategory::Coordination)
    }

    fn emit(
        &mut self,
        key: &str,
        kind: EventKind,
        status: EventStatus,
        payload: Value,
        visibility: Visibility,
    ) -> TranslatedEvent {
        let timestamp = self.next_timestamp();
        let (source_name, source_kind, depth) = match self.nodes.get(key) {
            Some(n) => (n.name.clone(), n.kind, n.depth),
            None => (key.to_string(), SourceKind::Agent, 0),
        };
        TranslatedEvent {
            event: StreamEvent {
                event_id: EventId::new(),
                timestamp,
                source_name,
                source_kind,
                depth,
                kind,
                payload,
                status,
            },
            visibility,
            capability: None,
        }
    }

    /// Wall clock, clamped so timestamps never go backwards.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn thought_of(args: &Value) -> Option<String> {
    ["thought", "reasoning", "analysis", "title"]
        .iter()
        .find_map(|k| text_of(args.get(k)))
}

fn optional_fields(raw: &RawEvent, keys: &[&str]) -> Value {
    let map: Map<String, Value> = keys
        .iter()
        .filter_map(|k| raw.field(k).map(|v| ((*k).to_string(), v.clone())))
        .collect();
    Value::Object(map)
}
