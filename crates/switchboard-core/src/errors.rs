use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Errors raised by execution engines and their transports.
/// Classified as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    // Fatal
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("engine configuration rejected: {0}")]
    Configuration(String),

    // Retryable
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("engine error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Unavailable(_)
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::Configuration(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after, .. } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging, metrics and client errors.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Configuration(_) => "configuration",
            Self::RateLimited { .. } => "rate_limit",
            Self::ServerError { .. } => "server_error",
            Self::Unavailable(_) => "unavailable",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited {
                retry_after: parse_retry_hint(&body),
                message: body,
            },
            503 => Self::Unavailable(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Classify an error message reported inside an engine stream.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
            Self::RateLimited {
                retry_after: parse_retry_hint(message),
                message: message.to_owned(),
            }
        } else if lower.contains("overloaded") || lower.contains("unavailable") || lower.contains("503") {
            Self::Unavailable(message.to_owned())
        } else {
            Self::StreamInterrupted(message.to_owned())
        }
    }
}

/// Extract a `retry in N[s]` hint from a provider message.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)retry\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*s?").ok())
        .as_ref()?;
    let caps = re.captures(message)?;
    let secs: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(secs.ceil()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::RateLimited { retry_after: None, message: String::new() }.is_retryable());
        assert!(EngineError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(EngineError::Unavailable("down".into()).is_retryable());
        assert!(EngineError::NetworkError("tcp".into()).is_retryable());
        assert!(EngineError::StreamInterrupted("eof".into()).is_retryable());
    }

    #[test]
    fn fatal_and_operational() {
        assert!(EngineError::InvalidRequest("bad".into()).is_fatal());
        assert!(EngineError::Configuration("tools".into()).is_fatal());
        let timeout = EngineError::Timeout(Duration::from_secs(120));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(EngineError::from_status(400, "bad".into()).is_fatal());
        assert!(EngineError::from_status(429, "slow down".into()).is_retryable());
        assert!(EngineError::from_status(502, "bad gateway".into()).is_retryable());
        assert_eq!(EngineError::from_status(503, "x".into()).error_kind(), "unavailable");
    }

    #[test]
    fn rate_limit_status_carries_hint() {
        let err = EngineError::from_status(429, "Quota exceeded. Please retry in 17.2s".into());
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(18)));
    }

    #[test]
    fn parse_retry_hint_variants() {
        assert_eq!(parse_retry_hint("retry in 5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_hint("Retry after 30 seconds"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_hint("try again later"), None);
    }

    #[test]
    fn from_message_classifies() {
        assert_eq!(EngineError::from_message("429 RESOURCE_EXHAUSTED rate limit").error_kind(), "rate_limit");
        assert_eq!(EngineError::from_message("model overloaded").error_kind(), "unavailable");
        assert_eq!(EngineError::from_message("socket closed").error_kind(), "stream_interrupted");
    }
}
