//! Request pipeline: connects sessions, tool scoping, memory, isolation and
//! the execution engine to a per-request channel of client events.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use switchboard_core::config::{RequestOverride, RuntimeConfiguration};
use switchboard_core::engine::{ExecutionEngine, ExecutionRequest, RawEventStream};
use switchboard_core::errors::EngineError;
use switchboard_core::events::{ClientEvent, EventKind, RawEvent, SourceKind, Visibility};
use switchboard_core::ids::{RequestId, SessionId, UserId};
use switchboard_core::summarizer::Turn;
use switchboard_core::tools::ToolDescriptor;
use switchboard_core::usage::TokenPricing;
use switchboard_core::Mode;
use switchboard_settings::OrchestrationSettings;
use switchboard_store::events::{AuditRecord, EventRepo};
use switchboard_store::memory::MemoryRepo;
use switchboard_store::Database;
use switchboard_telemetry::{Counter, Diagnostics};

use crate::error::{IsolationError, OrchestrationError};
use crate::isolation::{ConfigurationIsolator, ExecutionLease};
use crate::memory_scope::{memories_dependency, MemoryScopeFilter};
use crate::monitor::{AgentRef, DelegationMonitor, MonitorSignal};
use crate::naming::NamingScheduler;
use crate::session::SessionCoordinator;
use crate::toolset::{self, ToolPolicy};
use crate::translator::EventStreamTranslator;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub delegation_window: Duration,
    pub run_timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub tool_unavailable_threshold: u32,
    pub tool_policy: ToolPolicy,
    pub memory_limit: usize,
    pub pricing: TokenPricing,
}

impl From<&OrchestrationSettings> for OrchestratorConfig {
    fn from(s: &OrchestrationSettings) -> Self {
        Self {
            delegation_window: s.delegation_window(),
            run_timeout: s.run_timeout(),
            max_retries: s.max_retries,
            retry_base: Duration::from_secs(s.retry_base_secs),
            retry_cap: Duration::from_secs(s.retry_cap_secs),
            tool_unavailable_threshold: s.tool_unavailable_threshold,
            tool_policy: ToolPolicy {
                quick_excludes_deep_delegates: s.quick_excludes_deep_delegates,
            },
            memory_limit: s.memory_limit,
            pricing: s.pricing,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&OrchestrationSettings::default())
    }
}

/// One inbound chat message.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub message: String,
    /// Empty starts a new session.
    pub session_id: String,
    /// `None` keeps the session's stored mode.
    pub mode: Option<Mode>,
    pub user_id: String,
    pub instructions: Option<String>,
    pub entitlements: BTreeSet<String>,
}

/// An accepted request. `events` ends with [`ClientEvent::Done`].
pub struct RunHandle {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub mode: Mode,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Snapshot of an active run.
#[derive(Clone, Debug)]
pub struct RunState {
    pub request_id: RequestId,
    pub elapsed: Duration,
}

struct ActiveRun {
    request_id: RequestId,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Exponential backoff: `base * 2^attempt`, capped. An engine hint wins but
/// is capped too.
pub fn retry_delay(attempt: u32, suggested: Option<Duration>, base: Duration, cap: Duration) -> Duration {
    if let Some(delay) = suggested {
        return delay.min(cap);
    }
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

pub struct Orchestrator {
    engine: Arc<dyn ExecutionEngine>,
    isolator: Arc<ConfigurationIsolator>,
    sessions: SessionCoordinator,
    memory: Arc<MemoryScopeFilter>,
    audit: EventRepo,
    catalog: Arc<Vec<ToolDescriptor>>,
    diagnostics: Arc<Diagnostics>,
    config: OrchestratorConfig,
    active_runs: Arc<DashMap<SessionId, ActiveRun>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        isolator: Arc<ConfigurationIsolator>,
        db: Database,
        naming: Option<NamingScheduler>,
        catalog: Vec<ToolDescriptor>,
        diagnostics: Arc<Diagnostics>,
        config: OrchestratorConfig,
    ) -> Self {
        let memory = MemoryScopeFilter::new(
            MemoryRepo::new(db.clone()),
            config.memory_limit,
            Arc::clone(&diagnostics),
        );
        Self {
            engine,
            isolator,
            sessions: SessionCoordinator::new(db.clone(), naming),
            memory: Arc::new(memory),
            audit: EventRepo::new(db),
            catalog: Arc::new(catalog),
            diagnostics,
            config,
            active_runs: Arc::new(DashMap::new()),
        }
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub fn isolator(&self) -> &Arc<ConfigurationIsolator> {
        &self.isolator
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn audit(&self) -> &EventRepo {
        &self.audit
    }

    /// Accept a chat message and start its run in the background.
    #[instrument(skip_all, fields(user_id = %request.user_id, session_id = %request.session_id))]
    pub fn start(&self, request: ChatRequest) -> Result<RunHandle, OrchestrationError> {
        if request.message.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest("message must not be empty".into()));
        }
        if request.user_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest("user_id must not be empty".into()));
        }
        if self.isolator.is_halted() {
            self.diagnostics.incr(Counter::RequestsRejected);
            return Err(IsolationError::Halted.into());
        }

        let user_id = UserId::from_raw(request.user_id.trim());
        let mut session = self.sessions.resolve(&request.session_id, &user_id)?;
        let session_id = session.session_id.clone();
        let request_id = RequestId::new();
        let cancel = CancellationToken::new();

        let slot = match self.active_runs.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                self.diagnostics.incr(Counter::RequestsRejected);
                return Err(OrchestrationError::SessionBusy(session_id));
            }
            Entry::Vacant(v) => {
                v.insert(ActiveRun {
                    request_id: request_id.clone(),
                    cancel: cancel.clone(),
                    started_at: Instant::now(),
                });
                RunSlot {
                    runs: Arc::clone(&self.active_runs),
                    session_id: session_id.clone(),
                    request_id: request_id.clone(),
                }
            }
        };

        if let Some(mode) = request.mode {
            if mode != session.mode {
                self.sessions.update_mode(&session_id, mode)?;
                session.mode = mode;
            }
        }
        self.sessions.append_turn(&session_id, &Turn::user(request.message.clone()))?;

        let ovr = self.build_override(&request, session.mode, &user_id);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.diagnostics.incr(Counter::RequestsStarted);
        self.diagnostics.run_started();
        info!(
            request_id = %request_id,
            session_id = %session_id,
            mode = %session.mode,
            strategy = self.isolator.strategy_name(),
            "run accepted"
        );

        let run = Run {
            request_id: request_id.clone(),
            session_id: session_id.clone(),
            user_id,
            mode: session.mode,
            input: request.message,
            ovr,
            engine: Arc::clone(&self.engine),
            isolator: Arc::clone(&self.isolator),
            sessions: self.sessions.clone(),
            audit: self.audit.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            config: self.config.clone(),
            cancel,
            tx,
            slot,
        };
        tokio::spawn(run.drive());

        Ok(RunHandle {
            request_id,
            session_id,
            mode: session.mode,
            events: rx,
        })
    }

    fn build_override(&self, request: &ChatRequest, mode: Mode, user_id: &UserId) -> RequestOverride {
        let baseline = self.isolator.baseline().snapshot();
        let delta = toolset::resolve(
            mode,
            &baseline.base_tools,
            &self.catalog,
            &request.entitlements,
            self.config.tool_policy,
        );
        if !delta.removed.is_empty() {
            debug!(mode = %mode, removed = ?delta.removed, "tools removed for request");
        }

        let scope = self.memory.scope_for(&request.message);
        let memories = self.memory.search(&scope, user_id);

        let mut builder = RequestOverride::builder(mode)
            .delta(delta)
            .dependency("memories", memories_dependency(&memories))
            .dependency("mode", json!(mode.as_str()));
        if let Some(extra) = request.instructions.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            builder = builder.instructions(extra);
        }
        builder.build()
    }

    /// Cancel the active run of a session. Returns whether one was running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.active_runs.get(session_id) {
            Some(run) => {
                info!(session_id = %session_id, request_id = %run.request_id, "cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let mut n = 0;
        for run in self.active_runs.iter() {
            run.cancel.cancel();
            n += 1;
        }
        if n > 0 {
            info!(count = n, "cancelled all active runs");
        }
        n
    }

    pub fn state(&self, session_id: &SessionId) -> Option<RunState> {
        self.active_runs.get(session_id).map(|run| RunState {
            request_id: run.request_id.clone(),
            elapsed: run.started_at.elapsed(),
        })
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.len()
    }

    /// Operator entry point after a configuration leak.
    pub async fn reconcile(&self) -> Result<(), OrchestrationError> {
        self.isolator.reconcile().await?;
        Ok(())
    }
}

/// Registry entry for one run. Removed when released or dropped.
struct RunSlot {
    runs: Arc<DashMap<SessionId, ActiveRun>>,
    session_id: SessionId,
    request_id: RequestId,
}

impl RunSlot {
    fn release(&self) {
        self.runs
            .remove_if(&self.session_id, |_, run| run.request_id == self.request_id);
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.release();
    }
}

enum RunEnd {
    Completed,
    Failed(EngineError),
    Cancelled,
}

enum StreamEnd {
    Finished,
    Failed(EngineError),
    Cancelled,
    TimedOut,
}

/// What the run collected while streaming.
#[derive(Default)]
struct Collected {
    audit: Vec<AuditRecord>,
    assistant_text: String,
    forwarded: bool,
    frozen: Vec<AgentRef>,
}

struct Tracking {
    translator: EventStreamTranslator,
    monitor: DelegationMonitor,
}

struct Run {
    request_id: RequestId,
    session_id: SessionId,
    user_id: UserId,
    mode: Mode,
    input: String,
    ovr: RequestOverride,
    engine: Arc<dyn ExecutionEngine>,
    isolator: Arc<ConfigurationIsolator>,
    sessions: SessionCoordinator,
    audit: EventRepo,
    diagnostics: Arc<Diagnostics>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<ClientEvent>,
    slot: RunSlot,
}

impl Run {
    async fn drive(self) {
        let started = Instant::now();
        self.emit(ClientEvent::Session {
            session_id: self.session_id.clone(),
            mode: self.mode,
            request_id: self.request_id.to_string(),
        })
        .await;

        let mut collected = Collected::default();
        let isolator = Arc::clone(&self.isolator);
        let outcome = isolator
            .with_override(&self.request_id, &self.ovr, |lease, configuration| {
                self.execute(lease, configuration, &mut collected)
            })
            .await;

        let end = match outcome {
            Ok(end) => end,
            Err(e) => {
                warn!(request_id = %self.request_id, error = %e, "run failed in isolation layer");
                self.emit(ClientEvent::Error {
                    error_type: OrchestrationError::from(e).error_kind().to_string(),
                    message: "the assistant is temporarily unavailable".into(),
                    retryable: false,
                })
                .await;
                self.diagnostics.incr(Counter::RequestsFailed);
                self.finish(collected, started, false).await;
                return;
            }
        };

        let cancelled = matches!(end, RunEnd::Cancelled);
        match end {
            RunEnd::Completed => {
                if !collected.frozen.is_empty() {
                    let targets: Vec<String> = collected.frozen.iter().map(describe).collect();
                    self.emit(ClientEvent::Error {
                        error_type: "delegation_frozen".into(),
                        message: format!("{} never started working on this. Please try again.", targets.join(", ")),
                        retryable: true,
                    })
                    .await;
                }
                self.diagnostics.incr(Counter::RequestsCompleted);
            }
            RunEnd::Failed(e) => {
                if let EngineError::Timeout(_) = e {
                    self.diagnostics.incr(Counter::RunTimeouts);
                }
                warn!(request_id = %self.request_id, error = %e, kind = e.error_kind(), "run failed");
                self.emit(ClientEvent::Error {
                    error_type: e.error_kind().to_string(),
                    message: e.to_string(),
                    retryable: e.is_retryable() || matches!(e, EngineError::Timeout(_)),
                })
                .await;
                self.diagnostics.incr(Counter::RequestsFailed);
            }
            RunEnd::Cancelled => {
                info!(request_id = %self.request_id, "run cancelled");
                self.diagnostics.incr(Counter::RequestsCancelled);
            }
        }

        self.finish(collected, started, cancelled).await;
    }

    /// Runs under the lease. Retries only while nothing reached the client.
    async fn execute(
        &self,
        lease: ExecutionLease,
        configuration: RuntimeConfiguration,
        collected: &mut Collected,
    ) -> RunEnd {
        debug!(request_id = %self.request_id, lease_id = %lease.lease_id, "lease acquired");
        let mut tracking = Tracking {
            translator: EventStreamTranslator::new(&configuration.tools).with_pricing(self.config.pricing),
            monitor: DelegationMonitor::new(
                self.config.delegation_window,
                self.config.tool_unavailable_threshold,
                &configuration.tools,
            ),
        };
        let deadline = Instant::now() + self.config.run_timeout;
        let mut attempt = 0u32;

        let end = loop {
            let request = ExecutionRequest {
                request_id: self.request_id.clone(),
                input: self.input.clone(),
                session_id: self.session_id.clone(),
                user_id: self.user_id.clone(),
                configuration: configuration.clone(),
                cancel: self.cancel.clone(),
            };

            let started = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break RunEnd::Cancelled,
                _ = sleep_until(deadline) => break RunEnd::Failed(EngineError::Timeout(self.config.run_timeout)),
                r = self.engine.execute(request) => r,
            };

            let failure = match started {
                Ok(stream) => match self.consume(stream, &mut tracking, collected, deadline).await {
                    StreamEnd::Finished => break RunEnd::Completed,
                    StreamEnd::Cancelled => break RunEnd::Cancelled,
                    StreamEnd::TimedOut => break RunEnd::Failed(EngineError::Timeout(self.config.run_timeout)),
                    StreamEnd::Failed(e) => e,
                },
                Err(e) => e,
            };

            if matches!(failure, EngineError::Cancelled) || self.cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }
            if !failure.is_retryable() || collected.forwarded || attempt >= self.config.max_retries {
                break RunEnd::Failed(failure);
            }

            let delay = retry_delay(
                attempt,
                failure.suggested_delay(),
                self.config.retry_base,
                self.config.retry_cap,
            );
            attempt += 1;
            self.diagnostics.incr(Counter::EngineRetries);
            warn!(
                request_id = %self.request_id,
                attempt,
                delay_secs = delay.as_secs(),
                error = %failure,
                "retrying engine call"
            );
            self.emit(ClientEvent::Retry {
                attempt,
                max_retries: self.config.max_retries,
                delay_secs: delay.as_secs(),
                message: failure.to_string(),
            })
            .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break RunEnd::Cancelled,
                _ = sleep_until(deadline) => break RunEnd::Failed(EngineError::Timeout(self.config.run_timeout)),
                _ = sleep(delay) => {}
            }
        };

        if matches!(end, RunEnd::Cancelled) {
            let abandoned = tracking.monitor.abandon_all();
            if abandoned > 0 {
                debug!(request_id = %self.request_id, abandoned, "open delegations abandoned");
            }
        }
        collected.frozen = tracking
            .monitor
            .frozen()
            .map(|r| r.announced_target.clone())
            .collect();
        end
    }

    async fn consume(
        &self,
        mut stream: RawEventStream,
        tracking: &mut Tracking,
        collected: &mut Collected,
        deadline: Instant,
    ) -> StreamEnd {
        loop {
            let freeze_at = tracking.monitor.next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                _ = sleep_until(deadline) => return StreamEnd::TimedOut,
                _ = sleep_until_opt(freeze_at) => {
                    let signals = tracking.monitor.poll(Instant::now());
                    self.react(signals).await;
                }
                item = stream.next() => match item {
                    None if self.cancel.is_cancelled() => return StreamEnd::Cancelled,
                    None => return StreamEnd::Finished,
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    Some(Ok(raw)) => self.handle(&raw, tracking, collected).await,
                },
            }
        }
    }

    async fn handle(&self, raw: &RawEvent, tracking: &mut Tracking, collected: &mut Collected) {
        let translated = match tracking.translator.translate(raw) {
            Ok(events) => events,
            Err(e) => {
                self.diagnostics.incr(Counter::StreamParseErrors);
                warn!(request_id = %self.request_id, error = %e, "dropping engine event");
                return;
            }
        };

        for t in translated {
            let signals = tracking.monitor.observe(&t.event, Instant::now());
            self.react(signals).await;

            if t.event.source_kind == SourceKind::Main && t.event.kind == EventKind::Content {
                if let Some(text) = t.event.payload.get("content").and_then(|v| v.as_str()) {
                    collected.assistant_text.push_str(text);
                }
            }
            collected.audit.push(AuditRecord {
                session_id: self.session_id.clone(),
                request_id: self.request_id.clone(),
                sequence: collected.audit.len() as u32,
                visibility: t.visibility,
                event: t.event.clone(),
            });

            if t.visibility == Visibility::Client {
                collected.forwarded = true;
                let capability = t.capability.map(|tool_name| ClientEvent::Capability {
                    event_id: t.event.event_id.clone(),
                    tool_name,
                    source_name: t.event.source_name.clone(),
                    depth: t.event.depth,
                });
                self.emit(ClientEvent::Stream(t.event)).await;
                if let Some(capability) = capability {
                    self.emit(capability).await;
                }
            }
        }
    }

    async fn react(&self, signals: Vec<MonitorSignal>) {
        for signal in signals {
            match signal {
                MonitorSignal::Announced(target) => {
                    debug!(request_id = %self.request_id, target = %target, "delegation announced");
                }
                MonitorSignal::Executing(target) => {
                    debug!(request_id = %self.request_id, target = %target, "delegation executing");
                }
                MonitorSignal::Completed(target) => {
                    debug!(request_id = %self.request_id, target = %target, "delegation completed");
                }
                MonitorSignal::Frozen { target, waited } => {
                    self.diagnostics.incr(Counter::DelegationFreezes);
                    warn!(
                        request_id = %self.request_id,
                        session_id = %self.session_id,
                        target = %target,
                        waited_ms = waited.as_millis() as u64,
                        "delegation announced but not started"
                    );
                    self.emit(ClientEvent::notice(
                        "delegation_frozen",
                        format!("Still working: waiting for {} to start.", describe(&target)),
                    ))
                    .await;
                }
                MonitorSignal::Recovered { target, late_by } => {
                    self.diagnostics.incr(Counter::DelegationRecoveries);
                    info!(
                        request_id = %self.request_id,
                        target = %target,
                        late_ms = late_by.as_millis() as u64,
                        "frozen delegation started late"
                    );
                }
                MonitorSignal::ToolUnavailable { tool, streak } => {
                    self.diagnostics.incr(Counter::ToolUnavailable);
                    warn!(request_id = %self.request_id, tool = %tool, streak, "tool unavailable");
                    self.emit(ClientEvent::notice(
                        "tool_unavailable",
                        format!("{tool} is not available right now, continuing with the tools that are."),
                    ))
                    .await;
                }
            }
        }
    }

    /// Persist, schedule naming, free the session, then send `Done`.
    async fn finish(&self, collected: Collected, started: Instant, cancelled: bool) {
        if !collected.assistant_text.is_empty() {
            if let Err(e) = self
                .sessions
                .append_turn(&self.session_id, &Turn::assistant(collected.assistant_text))
            {
                warn!(request_id = %self.request_id, error = %e, "failed to persist assistant turn");
            }
        }
        if let Err(e) = self.audit.append_all(&collected.audit) {
            warn!(request_id = %self.request_id, error = %e, "failed to persist audit events");
        }
        self.sessions.schedule_naming(&self.session_id);

        let elapsed = started.elapsed();
        self.diagnostics.run_finished(elapsed);
        self.slot.release();
        info!(
            request_id = %self.request_id,
            session_id = %self.session_id,
            elapsed_ms = elapsed.as_millis() as u64,
            cancelled,
            "run finished"
        );

        self.emit(ClientEvent::Done {
            session_id: self.session_id.clone(),
            cancelled,
        })
        .await;
    }

    /// A closed receiver means the client went away: cancel the run.
    async fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).await.is_err() && !self.cancel.is_cancelled() {
            debug!(request_id = %self.request_id, "client disconnected, cancelling run");
            self.cancel.cancel();
        }
    }
}

fn describe(target: &AgentRef) -> String {
    match target {
        AgentRef::Named(name) => name.clone(),
        AgentRef::Unspecified => "the team".to_string(),
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
