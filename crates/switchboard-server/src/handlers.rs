use std::collections::BTreeSet;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use switchboard_core::events::ClientEvent;
use switchboard_core::ids::{SessionId, UserId};
use switchboard_core::session::SessionState;
use switchboard_core::Mode;
use switchboard_engine::{ChatRequest, OrchestrationError};
use switchboard_telemetry::LogQuery;

use crate::error::ApiError;
use crate::server::AppState;

const DEFAULT_PAGE: u32 = 20;
const MAX_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    pub user_id: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
}

impl From<ChatBody> for ChatRequest {
    fn from(body: ChatBody) -> Self {
        Self {
            message: body.message,
            session_id: body.session_id.unwrap_or_default(),
            mode: body.mode,
            user_id: body.user_id,
            instructions: body.instructions,
            entitlements: body.entitlements,
        }
    }
}

fn to_sse(event: &ClientEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!(error = %e, event_type = event.event_type(), "failed to serialize client event");
        json!({"type": "error", "error_type": "serialization", "message": e.to_string(), "retryable": false})
            .to_string()
    });
    Event::default().event(event.event_type()).data(data)
}

/// `POST /chat`: one SSE event per client event, ending with `done`.
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state.orchestrator.start(body.into())?;
    info!(session_id = %handle.session_id, request_id = %handle.request_id, "chat stream opened");

    let events = ReceiverStream::new(handle.events).map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive).text("keep-alive")))
}

/// `POST /sessions/{id}/cancel?user_id=`
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = owned_session(&state, id, &q.user_id)?;
    let cancelled = state.orchestrator.cancel(&session.session_id);
    info!(session_id = %session.session_id, cancelled, "cancel requested");
    Ok(Json(json!({"session_id": session.session_id, "cancelled": cancelled})))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: String,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// `GET /sessions?user_id=&limit=&offset=`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    if q.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }
    let limit = q.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = q.offset.unwrap_or(0);
    let sessions = state
        .orchestrator
        .sessions()
        .list(&UserId::from_raw(q.user_id.trim()), limit, offset)?;
    Ok(Json(json!({"sessions": sessions, "limit": limit, "offset": offset})))
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    #[serde(default)]
    pub user_id: String,
}

/// Every per-session route names its caller; only the owner gets through.
fn owned_session(state: &AppState, id: String, owner: &str) -> Result<SessionState, ApiError> {
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }
    let session_id = SessionId::from_raw(id);
    let session = state.orchestrator.sessions().get(&session_id)?;
    let user_id = UserId::from_raw(owner);
    if session.user_id != user_id {
        return Err(OrchestrationError::SessionOwnership { session_id, user_id }.into());
    }
    Ok(session)
}

/// `GET /sessions/{id}?user_id=`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = owned_session(&state, id, &q.user_id)?;
    let run = state.orchestrator.state(&session.session_id);
    Ok(Json(json!({
        "session": session,
        "active_request_id": run.map(|r| r.request_id),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ModeBody {
    pub mode: Mode,
    #[serde(default)]
    pub user_id: String,
}

/// `PUT /sessions/{id}/mode`
pub async fn update_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ModeBody>,
) -> Result<Json<Value>, ApiError> {
    let session = owned_session(&state, id, &body.user_id)?;
    state
        .orchestrator
        .sessions()
        .update_mode(&session.session_id, body.mode)?;
    info!(session_id = %session.session_id, mode = %body.mode, "mode updated");
    Ok(Json(json!({"session_id": session.session_id, "mode": body.mode})))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub user_id: String,
    pub limit: Option<u32>,
}

/// `GET /sessions/{id}/events?user_id=`: the audit log, including events the client
/// never saw.
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = owned_session(&state, id, &q.user_id)?;
    let limit = q.limit.unwrap_or(500).clamp(1, 5_000);
    let records = state
        .orchestrator
        .audit()
        .list_for_session(&session.session_id, limit)?;
    let events: Vec<Value> = records
        .into_iter()
        .map(|r| {
            json!({
                "request_id": r.request_id,
                "sequence": r.sequence,
                "visibility": r.visibility,
                "event": r.event,
            })
        })
        .collect();
    Ok(Json(json!({"session_id": session.session_id, "events": events})))
}

/// `POST /admin/reconcile`
pub async fn reconcile(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.orchestrator.reconcile().await?;
    Ok(Json(json!({
        "status": "reconciled",
        "halted": state.orchestrator.isolator().is_halted(),
    })))
}

/// `GET /admin/logs?level=&session_id=&request_id=&limit=`: persisted warn+
/// records, newest first.
pub async fn logs(State(state): State<AppState>, Query(mut q): Query<LogQuery>) -> Result<Json<Value>, ApiError> {
    let Some(sink) = state.logs.as_ref() else {
        return Ok(Json(json!({"enabled": false, "logs": []})));
    };
    q.level = q.level.map(|l| l.to_uppercase());
    q.limit = Some(q.limit.unwrap_or(100).clamp(1, 1_000));
    let records = sink.query(&q).map_err(|e| ApiError::Logs(e.to_string()))?;
    Ok(Json(json!({"enabled": true, "count": records.len(), "logs": records})))
}

/// `GET /health`: 503 while the isolator is halted.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let isolator = state.orchestrator.isolator();
    let halted = isolator.is_halted();
    let body = json!({
        "status": if halted { "halted" } else { "healthy" },
        "isolation": isolator.strategy_name(),
        "active_runs": state.orchestrator.active_run_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    let status = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.orchestrator.diagnostics().snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or_else(|e| json!({"error": e.to_string()})))
}
