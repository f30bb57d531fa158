use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;

use switchboard_core::config::RuntimeConfiguration;
use switchboard_core::engine::{AmbientRuntime, ExecutionEngine, ExecutionRequest, RawEventStream};
use switchboard_core::errors::EngineError;
use switchboard_core::events::RawEvent;
use switchboard_core::ids::{RequestId, SessionId};

type Item = Result<RawEvent, EngineError>;

/// Pre-programmed engine behaviour for deterministic tests.
pub enum ScriptedResponse {
    /// Yield a sequence of raw events.
    Stream(Vec<Item>),
    /// Sleep before each event.
    Paced(Duration, Vec<Item>),
    /// Yield the events, then stay open until cancelled.
    Hang(Vec<Item>),
    /// Fail the `execute` call itself.
    Error(EngineError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    pub fn events(events: Vec<RawEvent>) -> Self {
        Self::Stream(events.into_iter().map(Ok).collect())
    }

    /// A complete single-agent run answering `text`.
    pub fn text(agent: &str, text: &str) -> Self {
        Self::events(vec![
            RawEvent::new(json!({"event": "RunStarted", "agent_name": agent})),
            RawEvent::new(json!({"event": "RunContent", "agent_name": agent, "content": text})),
            RawEvent::new(json!({"event": "RunCompleted", "agent_name": agent})),
        ])
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What the engine saw on one call.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub input: String,
    /// The configuration the call ran under: the per-call one, or the ambient
    /// runtime's at call time when the engine is ambient.
    pub observed: RuntimeConfiguration,
}

/// Engine that plays back scripted responses in order.
///
/// When the script is exhausted and echo is enabled, each call answers with
/// its observed instructions joined by newlines, which lets isolation tests
/// check what a call actually ran under.
pub struct ScriptedEngine {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: AtomicUsize,
    ambient: Option<Arc<dyn AmbientRuntime>>,
    echo_delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            ambient: None,
            echo_delay: None,
        }
    }

    /// Answer every unscripted call by echoing its instructions after `delay`.
    pub fn echo(delay: Duration) -> Self {
        Self {
            echo_delay: Some(delay),
            ..Self::new(Vec::new())
        }
    }

    /// Ignore the per-call configuration and read `runtime` instead.
    pub fn with_ambient(mut self, runtime: Arc<dyn AmbientRuntime>) -> Self {
        self.ambient = Some(runtime);
        self
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn observe(&self, request: &ExecutionRequest) -> RuntimeConfiguration {
        match &self.ambient {
            Some(runtime) => runtime.current(),
            None => request.configuration.clone(),
        }
    }

    fn record(&self, request: &ExecutionRequest, observed: RuntimeConfiguration) {
        self.calls.lock().push(RecordedCall {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            input: request.input.clone(),
            observed,
        });
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<RawEventStream, EngineError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let scripted = self.responses.lock().pop_front();

        let mut current = match (scripted, self.echo_delay) {
            (Some(response), _) => response,
            (None, Some(delay)) => {
                tokio::time::sleep(delay).await;
                let observed = self.observe(&request);
                let text = observed.instructions.join("\n");
                self.record(&request, observed);
                return Ok(until_cancelled(
                    ScriptedResponse::text("assistant", &text),
                    &request,
                ));
            }
            (None, None) => {
                return Err(EngineError::InvalidRequest(format!(
                    "ScriptedEngine: no response configured for call {idx}"
                )))
            }
        };

        self.record(&request, self.observe(&request));

        loop {
            match current {
                ScriptedResponse::Error(e) => return Err(e),
                ScriptedResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                other => return Ok(until_cancelled(other, &request)),
            }
        }
    }
}

fn until_cancelled(response: ScriptedResponse, request: &ExecutionRequest) -> RawEventStream {
    let events: RawEventStream = match response {
        ScriptedResponse::Stream(items) => Box::pin(stream::iter(items)),
        ScriptedResponse::Paced(pace, items) => Box::pin(stream::iter(items).then(move |item| async move {
            tokio::time::sleep(pace).await;
            item
        })),
        ScriptedResponse::Hang(items) => Box::pin(stream::iter(items).chain(stream::pending())),
        ScriptedResponse::Error(e) => Box::pin(stream::iter(vec![Err(e)])),
        ScriptedResponse::Delay(_, inner) => return until_cancelled(*inner, request),
    };
    Box::pin(events.take_until(request.cancel.clone().cancelled_owned()))
}
