use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post, put};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use switchboard_engine::Orchestrator;
use switchboard_telemetry::SqliteLogSink;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// Applies to every route except the chat stream.
    pub request_timeout: Duration,
    pub cors_allow_any: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            keep_alive: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            cors_allow_any: false,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub keep_alive: Duration,
    pub started_at: Instant,
    /// Persisted warn+ logs, absent when SQLite logging is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, keep_alive: Duration) -> Self {
        Self {
            orchestrator,
            keep_alive,
            started_at: Instant::now(),
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/mode", put(handlers::update_mode))
        .route("/sessions/{id}/cancel", post(handlers::cancel_session))
        .route("/sessions/{id}/events", get(handlers::session_events))
        .route("/admin/reconcile", post(handlers::reconcile))
        .route("/admin/logs", get(handlers::logs))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(TimeoutLayer::new(config.request_timeout));

    let router = Router::new()
        .route("/chat", post(handlers::chat))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors_allow_any {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Bind and serve. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(Arc::clone(&orchestrator), config.keep_alive).with_logs(logs);
    let router = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, isolation = orchestrator.isolator().strategy_name(), "switchboard server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        orchestrator,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Cancel active runs so their streams close, then stop accepting.
    pub async fn shutdown(self) {
        let cancelled = self.orchestrator.cancel_all();
        tracing::info!(cancelled, "shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}
