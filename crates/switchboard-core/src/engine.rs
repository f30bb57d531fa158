use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfiguration;
use crate::errors::EngineError;
use crate::events::RawEvent;
use crate::ids::{RequestId, SessionId, UserId};

pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, EngineError>> + Send>>;

/// Everything an engine needs for one call.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub request_id: RequestId,
    pub input: String,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub configuration: RuntimeConfiguration,
    pub cancel: CancellationToken,
}

/// External multi-agent execution engine.
///
/// Implementations must be re-entrant: several calls may be in flight at once,
/// each with its own configuration.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: ExecutionRequest) -> Result<RawEventStream, EngineError>;
}

/// Engines that only read a shared, mutable configuration instead of the
/// per-call one. Used by the leased isolation strategy.
pub trait AmbientRuntime: Send + Sync {
    fn current(&self) -> RuntimeConfiguration;

    fn apply(&self, configuration: &RuntimeConfiguration) -> Result<(), EngineError>;
}
