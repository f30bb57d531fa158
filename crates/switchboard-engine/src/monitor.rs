//! Freeze detection for announced delegations.
//!
//! The monitor is a pure state machine over translated events. Time is passed
//! in by the caller, which also owns the timer that fires at
//! [`DelegationMonitor::next_deadline`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use switchboard_core::events::{EventKind, EventStatus, SourceKind, StreamEvent};
use switchboard_core::tools::ToolSet;

/// Main-assistant text kept for matching announcements split across chunks.
const ANNOUNCEMENT_BUFFER: usize = 2_000;
const SENTENCE_ENDS: [char; 4] = ['.', '!', '?', '\n'];

const FUTURE_PHRASES: &[&str] = &["i'll ", "i will ", "i'm going to ", "let me have ", "let me ask "];
const GENERIC_DELEGATES: &[&str] = &["team", "specialist", "delegate", "have them"];
pub const DELEGATION_TOOLS: &[&str] = &[
    "delegate_task_to_member",
    "delegate_task_to_members",
    "transfer_task_to_member",
    "forward_task_to_member",
];
const UNAVAILABLE_MARKERS: &[&str] = &[
    "not available",
    "unavailable",
    "not found",
    "unknown tool",
    "no such tool",
    "not enabled",
];

/// Target of an announced delegation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AgentRef {
    /// Normalized delegate name.
    Named(String),
    /// "I'll ask the team" without saying which one.
    Unspecified,
}

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Unspecified => f.write_str("unspecified"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationState {
    Announced,
    Executing,
    Completed,
    Frozen,
    Abandoned,
}

#[derive(Clone, Debug)]
pub struct DelegationRecord {
    pub announced_at: Instant,
    pub announced_target: AgentRef,
    pub executed: bool,
    pub executed_at: Option<Instant>,
    pub state: DelegationState,
    /// Normalized source that started executing this delegation.
    executor: Option<String>,
}

impl DelegationRecord {
    fn is_open(&self) -> bool {
        matches!(self.state, DelegationState::Announced | DelegationState::Executing)
    }
}

/// Something the orchestrator should react to.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorSignal {
    Announced(AgentRef),
    Executing(AgentRef),
    Completed(AgentRef),
    Frozen { target: AgentRef, waited: Duration },
    /// A frozen delegation started after all.
    Recovered { target: AgentRef, late_by: Duration },
    ToolUnavailable { tool: String, streak: u32 },
}

pub struct DelegationMonitor {
    window: Duration,
    unavailable_threshold: u32,
    /// Normalized delegate name -> normalized parent team, if any.
    delegates: HashMap<String, Option<String>>,
    records: Vec<DelegationRecord>,
    main_text: String,
    unavailable_streak: u32,
}

/// Lower-case and treat `-`/`_` as spaces so "research-team" matches
/// "Research Team".
pub fn normalize(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl DelegationMonitor {
    pub fn new(window: Duration, unavailable_threshold: u32, tools: &ToolSet) -> Self {
        let delegates = tools
            .delegates()
            .map(|t| (normalize(&t.name), t.parent.as_deref().map(normalize)))
            .collect();
        Self {
            window,
            unavailable_threshold: unavailable_threshold.max(1),
            delegates,
            records: Vec::new(),
            main_text: String::new(),
            unavailable_streak: 0,
        }
    }

    pub fn records(&self) -> &[DelegationRecord] {
        &self.records
    }

    /// Delegations that froze and never recovered.
    pub fn frozen(&self) -> impl Iterator<Item = &DelegationRecord> {
        self.records.iter().filter(|r| r.state == DelegationState::Frozen)
    }

    /// Earliest instant at which an announced delegation will freeze.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records
            .iter()
            .filter(|r| r.state == DelegationState::Announced)
            .map(|r| r.announced_at + self.window)
            .min()
    }

    pub fn observe(&mut self, event: &StreamEvent, now: Instant) -> Vec<MonitorSignal> {
        let mut signals = self.poll(now);
        match (event.source_kind, event.kind) {
            (SourceKind::Main, EventKind::Content) => {
                if let Some(text) = event.payload.get("content").and_then(|v| v.as_str()) {
                    self.on_main_text(text, now, &mut signals);
                }
            }
            (_, EventKind::ToolCall) => self.on_tool_call(event, now, &mut signals),
            (SourceKind::Team | SourceKind::Agent, EventKind::Started) => {
                self.on_started(&normalize(&event.source_name), now, &mut signals);
            }
            (SourceKind::Team | SourceKind::Agent, EventKind::Completed) => {
                self.on_completed(&normalize(&event.source_name), &mut signals);
            }
            _ => {}
        }
        signals
    }

    /// Freeze every announced delegation whose window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Vec<MonitorSignal> {
        let window = self.window;
        self.records
            .iter_mut()
            .filter(|r| r.state == DelegationState::Announced && now >= r.announced_at + window)
            .map(|r| {
                r.state = DelegationState::Frozen;
                MonitorSignal::Frozen {
                    target: r.announced_target.clone(),
                    waited: now - r.announced_at,
                }
            })
            .collect()
    }

    /// Cancellation: open delegations are abandoned, never frozen.
    pub fn abandon_all(&mut self) -> usize {
        let mut n = 0;
        for r in self.records.iter_mut().filter(|r| r.is_open()) {
            r.state = DelegationState::Abandoned;
            n += 1;
        }
        n
    }

    fn on_main_text(&mut self, text: &str, now: Instant, signals: &mut Vec<MonitorSignal>) {
        self.main_text.push_str(text);
        if self.main_text.len() > ANNOUNCEMENT_BUFFER {
            let cut = self.main_text.len() - ANNOUNCEMENT_BUFFER;
            let cut = (cut..self.main_text.len())
                .find(|i| self.main_text.is_char_boundary(*i))
                .unwrap_or(self.main_text.len());
            self.main_text.drain(..cut);
        }

        // Phrase and delegate must share a sentence.
        let mut targets: Vec<AgentRef> = Vec::new();
        for sentence in self.main_text.split_inclusive(SENTENCE_ENDS) {
            for target in self.announcement_targets(sentence) {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }

        if targets.is_empty() {
            let tail = self.main_text.rfind(SENTENCE_ENDS).map_or(0, |i| i + 1);
            self.main_text.drain(..tail);
        } else {
            self.main_text.clear();
            for target in targets {
                self.announce(target, now, signals);
            }
        }
    }

    fn announcement_targets(&self, sentence: &str) -> Vec<AgentRef> {
        let text = sentence.to_lowercase().replace('\u{2019}', "'");
        if !FUTURE_PHRASES.iter().any(|p| text.contains(p)) {
            return Vec::new();
        }
        let spaced = normalize(&text);
        let mut named: Vec<AgentRef> = self
            .delegates
            .keys()
            .filter(|name| spaced.contains(name.as_str()))
            .map(|name| AgentRef::Named(name.clone()))
            .collect();
        named.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        if !named.is_empty() {
            return named;
        }
        if GENERIC_DELEGATES.iter().any(|g| text.contains(g)) {
            return vec![AgentRef::Unspecified];
        }
        Vec::new()
    }

    fn on_tool_call(&mut self, event: &StreamEvent, now: Instant, signals: &mut Vec<MonitorSignal>) {
        let tool = event.payload.get("tool_name").and_then(|v| v.as_str()).unwrap_or("");

        if event.source_kind == SourceKind::Main
            && event.status == EventStatus::Running
            && DELEGATION_TOOLS.contains(&tool)
        {
            let member = event
                .payload
                .get("args")
                .and_then(|a| a.get("member_id").or_else(|| a.get("member_name")))
                .and_then(|v| v.as_str())
                .map(normalize);
            let target = match member {
                Some(m) if !m.is_empty() => AgentRef::Named(m),
                _ => AgentRef::Unspecified,
            };
            self.announce(target, now, signals);
            return;
        }

        if event.status == EventStatus::Running {
            return;
        }
        let error = event
            .payload
            .get("error")
            .filter(|v| !v.is_null())
            .map(|v| v.as_str().map(str::to_lowercase).unwrap_or_else(|| v.to_string().to_lowercase()));
        match error {
            Some(msg) if UNAVAILABLE_MARKERS.iter().any(|m| msg.contains(m)) => {
                self.unavailable_streak += 1;
                if self.unavailable_streak >= self.unavailable_threshold {
                    signals.push(MonitorSignal::ToolUnavailable {
                        tool: tool.to_string(),
                        streak: self.unavailable_streak,
                    });
                    self.unavailable_streak = 0;
                }
            }
            Some(_) => {}
            None => self.unavailable_streak = 0,
        }
    }

    fn announce(&mut self, target: AgentRef, now: Instant, signals: &mut Vec<MonitorSignal>) {
        let already_open = self
            .records
            .iter()
            .any(|r| r.announced_target == target && r.state == DelegationState::Announced);
        if already_open {
            return;
        }
        self.records.push(DelegationRecord {
            announced_at: now,
            announced_target: target.clone(),
            executed: false,
            executed_at: None,
            state: DelegationState::Announced,
            executor: None,
        });
        signals.push(MonitorSignal::Announced(target));
    }

    fn satisfies(&self, target: &AgentRef, source: &str) -> bool {
        match target {
            AgentRef::Unspecified => true,
            AgentRef::Named(name) => {
                name == source
                    || self
                        .delegates
                        .get(source)
                        .is_some_and(|parent| parent.as_deref() == Some(name.as_str()))
            }
        }
    }

    fn on_started(&mut self, source: &str, now: Instant, signals: &mut Vec<MonitorSignal>) {
        // Named matches first so an unspecified record doesn't swallow them.
        let pick = |state: DelegationState, named_only: bool| {
            self.records.iter().position(|r| {
                r.state == state
                    && (!named_only || r.announced_target != AgentRef::Unspecified)
                    && self.satisfies(&r.announced_target, source)
            })
        };
        let found = pick(DelegationState::Announced, true)
            .or_else(|| pick(DelegationState::Frozen, true))
            .or_else(|| pick(DelegationState::Announced, false))
            .or_else(|| pick(DelegationState::Frozen, false));

        let Some(idx) = found else { return };
        let window = self.window;
        let record = &mut self.records[idx];
        let was_frozen = record.state == DelegationState::Frozen;
        record.state = DelegationState::Executing;
        record.executed = true;
        record.executed_at = Some(now);
        record.executor = Some(source.to_string());

        if was_frozen {
            signals.push(MonitorSignal::Recovered {
                target: record.announced_target.clone(),
                late_by: (now - record.announced_at).saturating_sub(window),
            });
        } else {
            signals.push(MonitorSignal::Executing(record.announced_target.clone()));
        }
    }

    fn on_completed(&mut self, source: &str, signals: &mut Vec<MonitorSignal>) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.state == DelegationState::Executing && r.executor.as_deref() == Some(source))
        {
            record.state = DelegationState::Completed;
            signals.push(MonitorSignal::Completed(record.announced_target.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};
    use switchboard_core::ids::EventId;
    use switchboard_core::tools::{ToolCategory, ToolDescriptor};

    fn tools() -> ToolSet {
        vec![
            ToolDescriptor::team("research-team", ToolCategory::DeepDelegate),
            ToolDescriptor::agent("web-researcher", Some("research-team")),
            ToolDescriptor::agent("audio-specialist", None),
        ]
        .into()
    }

    fn monitor() -> DelegationMonitor {
        DelegationMonitor::new(Duration::from_secs(10), 3, &tools())
    }

    fn ev(source: &str, kind: SourceKind, event: EventKind, status: EventStatus, payload: Value) -> StreamEvent {
        StreamEvent {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            source_name: source.into(),
            source_kind: kind,
            depth: 0,
            kind: event,
            payload,
            status,
        }
    }

    fn say(text: &str) -> StreamEvent {
        ev("assistant", SourceKind::Main, EventKind::Content, EventStatus::Running, json!({"content": text}))
    }

    fn started(source: &str) -> StreamEvent {
        ev(source, SourceKind::Team, EventKind::Started, EventStatus::Running, json!({}))
    }

    fn tool_result(tool: &str, error: Option<&str>) -> StreamEvent {
        let status = if error.is_some() { EventStatus::Failed } else { EventStatus::Completed };
        ev("Research Team", SourceKind::Team, EventKind::ToolCall, status, json!({"tool_name": tool, "error": error}))
    }

    #[test]
    fn normalize_names() {
        assert_eq!(normalize("Research-Team"), "research team");
        assert_eq!(normalize("  web_researcher "), "web researcher");
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_fires_exactly_at_window() {
        let mut m = monitor();
        let t0 = Instant::now();
        let signals = m.observe(&say("I'll ask the Research Team to dig into this."), t0);
        assert_eq!(signals, vec![MonitorSignal::Announced(AgentRef::Named("research team".into()))]);
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(10)));

        assert!(m.poll(t0 + Duration::from_millis(9_900)).is_empty());
        let frozen = m.poll(t0 + Duration::from_secs(10));
        assert_eq!(
            frozen,
            vec![MonitorSignal::Frozen {
                target: AgentRef::Named("research team".into()),
                waited: Duration::from_secs(10),
            }]
        );
        assert!(m.poll(t0 + Duration::from_secs(11)).is_empty());
        assert_eq!(m.next_deadline(), None);
        assert_eq!(m.frozen().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_within_window_executes_then_completes() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.observe(&say("Let me have the research team look at it"), t0);
        let s = m.observe(&started("Research Team"), t0 + Duration::from_secs(3));
        assert_eq!(s, vec![MonitorSignal::Executing(AgentRef::Named("research team".into()))]);
        assert!(m.poll(t0 + Duration::from_secs(30)).is_empty());

        let done = ev("Research Team", SourceKind::Team, EventKind::Completed, EventStatus::Completed, json!({}));
        let s = m.observe(&done, t0 + Duration::from_secs(40));
        assert_eq!(s, vec![MonitorSignal::Completed(AgentRef::Named("research team".into()))]);
        assert_eq!(m.records()[0].state, DelegationState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_start_recovers() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.observe(&say("I will ask our audio specialist."), t0);
        m.poll(t0 + Duration::from_secs(10));
        let s = m.observe(&started("audio-specialist"), t0 + Duration::from_secs(12));
        assert_eq!(
            s,
            vec![MonitorSignal::Recovered {
                target: AgentRef::Named("audio specialist".into()),
                late_by: Duration::from_secs(2),
            }]
        );
        assert_eq!(m.frozen().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_reference_is_unspecified_and_any_delegate_satisfies() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.observe(&say("I'm going to "), t0);
        let s = m.observe(&say("hand this to a specialist."), t0);
        assert_eq!(s, vec![MonitorSignal::Announced(AgentRef::Unspecified)]);
        let s = m.observe(&started("Some Other Agent"), t0 + Duration::from_secs(1));
        assert_eq!(s, vec![MonitorSignal::Executing(AgentRef::Unspecified)]);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_answers_do_not_announce() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert!(m.observe(&say("The research team published in 2021."), t0).is_empty());
        assert!(m.observe(&say("I'll explain it myself."), t0).is_empty());
        assert!(m.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delegation_tool_call_announces_member() {
        let mut m = monitor();
        let t0 = Instant::now();
        let call = ev(
            "assistant",
            SourceKind::Main,
            EventKind::ToolCall,
            EventStatus::Running,
            json!({"tool_name": "delegate_task_to_member", "args": {"member_id": "research-team", "task": "x"}}),
        );
        let s = m.observe(&call, t0);
        assert_eq!(s, vec![MonitorSignal::Announced(AgentRef::Named("research team".into()))]);
        // An agent inside the team also satisfies it.
        let agent = ev("Web Researcher", SourceKind::Agent, EventKind::Started, EventStatus::Running, json!({}));
        let s = m.observe(&agent, t0 + Duration::from_secs(1));
        assert_eq!(s, vec![MonitorSignal::Executing(AgentRef::Named("research team".into()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_instead_of_freezing() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.observe(&say("I'll ask the research team."), t0);
        assert_eq!(m.abandon_all(), 1);
        assert!(m.poll(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(m.records()[0].state, DelegationState::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_streak_signals_once_per_threshold() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert!(m.observe(&tool_result("tavily_search", Some("Tool not available")), t0).is_empty());
        assert!(m.observe(&tool_result("tavily_search", Some("tool unavailable")), t0).is_empty());
        let s = m.observe(&tool_result("exa_search", Some("Function exa_search not found")), t0);
        assert_eq!(
            s,
            vec![MonitorSignal::ToolUnavailable {
                tool: "exa_search".into(),
                streak: 3
            }]
        );
        assert!(m.observe(&tool_result("exa_search", Some("not found")), t0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_unavailable_streak() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.observe(&tool_result("a", Some("not available")), t0);
        m.observe(&tool_result("a", Some("not available")), t0);
        m.observe(&tool_result("a", None), t0);
        assert!(m.observe(&tool_result("a", Some("not available")), t0).is_empty());
    }
}
