use switchboard_core::errors::EngineError;
use switchboard_core::ids::{RequestId, SessionId, UserId};
use switchboard_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    /// The ambient runtime did not return to its snapshot. Traffic stops
    /// until an operator reconciles.
    #[error("configuration leak after request {request_id}: {detail}")]
    ConfigurationLeak { request_id: RequestId, detail: String },

    #[error("isolator halted after a configuration leak; reconcile required")]
    Halted,

    #[error("runtime rejected configuration: {0}")]
    Apply(EngineError),
}

/// A raw engine event that could not be translated. Dropped, never fatal.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamParseError {
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("event has no label")]
    MissingLabel,
    #[error("unrecognized event label: {0}")]
    Unrecognized(String),
    #[error("{label} is missing {field}")]
    MissingField { label: String, field: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("session {session_id} does not belong to user {user_id}")]
    SessionOwnership { session_id: SessionId, user_id: UserId },

    #[error("session {0} already has an active run")]
    SessionBusy(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl OrchestrationError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Isolation(IsolationError::ConfigurationLeak { .. }) => "configuration_leak",
            Self::Isolation(IsolationError::Halted) => "halted",
            Self::Isolation(IsolationError::Apply(_)) => "configuration",
            Self::Store(_) => "store",
            Self::Engine(e) => e.error_kind(),
            Self::SessionOwnership { .. } => "session_ownership",
            Self::SessionBusy(_) => "session_busy",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

