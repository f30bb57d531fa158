use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, instrument};

use switchboard_core::config::RuntimeConfiguration;
use switchboard_core::engine::{AmbientRuntime, ExecutionEngine, ExecutionRequest, RawEventStream};
use switchboard_core::errors::EngineError;

use crate::sse::SseEventStream;

/// Remote execution engine reached over HTTP.
///
/// Each call POSTs the request and its configuration as JSON and reads the
/// run back as a server-sent event stream. With an ambient runtime attached
/// the posted configuration is whatever that runtime holds at call time.
pub struct HttpEngine {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
    idle_timeout: Duration,
    ambient: Option<Arc<dyn AmbientRuntime>>,
}

#[derive(Serialize)]
struct RunBody<'a> {
    request_id: &'a str,
    session_id: &'a str,
    user_id: &'a str,
    input: &'a str,
    configuration: &'a RuntimeConfiguration,
}

impl HttpEngine {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
            idle_timeout,
            ambient: None,
        })
    }

    pub fn with_ambient(mut self, runtime: Arc<dyn AmbientRuntime>) -> Self {
        self.ambient = Some(runtime);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ExecutionEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(request_id = %request.request_id, session_id = %request.session_id))]
    async fn execute(&self, request: ExecutionRequest) -> Result<RawEventStream, EngineError> {
        let ambient = self.ambient.as_ref().map(|runtime| runtime.current());
        let body = RunBody {
            request_id: request.request_id.as_str(),
            session_id: request.session_id.as_str(),
            user_id: request.user_id.as_str(),
            input: &request.input,
            configuration: ambient.as_ref().unwrap_or(&request.configuration),
        };

        let mut req = self
            .client
            .post(&self.url)
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(EngineError::Cancelled),
            resp = req.send() => resp.map_err(|e| EngineError::NetworkError(e.to_string()))?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::from_status(status, body));
        }
        debug!(status = resp.status().as_u16(), "engine stream opened");

        let events = SseEventStream::new(resp.bytes_stream(), self.idle_timeout);
        Ok(Box::pin(events.take_until(request.cancel.clone().cancelled_owned())))
    }
}
