//! HTTP and WebSocket route handlers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use carelink_common::{CarelinkError, UserContext};
use carelink_engine::{PushFrame, PushHub};
use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rate_limit::WebSocketGuard;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub context: Option<UserContext>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: Uuid,
    pub intent: String,
    pub requires_human_handoff: bool,
    pub suggested_actions: Vec<String>,
    pub confidence_score: f32,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

fn rate_limited_response() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorResponse {
            error: "Rate limit exceeded. Please try again later.".into(),
            code: "RATE_LIMITED",
        }),
    )
}

fn map_engine_error(e: CarelinkError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        CarelinkError::Validation(_) => StatusCode::BAD_REQUEST,
        CarelinkError::SessionMissing(_) => StatusCode::NOT_FOUND,
        CarelinkError::StoreOutage(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let code = e.error_code();
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code,
        }),
    )
}

/// `POST /chat` - process one user message, returning the provisional
/// (or short-circuited final) response.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let client_ip = addr.ip();
    if !state.rate_limiter.check_request(client_ip) {
        warn!(ip = %client_ip, "rate limit exceeded for /chat");
        return Err(rate_limited_response());
    }

    let session_id = match request.session_id.as_deref() {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "session_id must be a v4 UUID".into(),
                    code: "VALIDATION",
                }),
            )
        })?),
        None => None,
    };

    info!(
        user_id = %request.user_id,
        message_preview = %request.message.chars().take(50).collect::<String>(),
        ?session_id,
        "processing chat request"
    );

    let started = Instant::now();
    let outcome = state
        .engine
        .process(&request.user_id, &request.message, session_id, request.context)
        .await
        .map_err(map_engine_error)?;
    let processing_time_ms = started.elapsed().as_millis() as u64;
    state.engine.metrics().observe_response_time(processing_time_ms);

    let status = if outcome.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = ChatResponse {
        response: outcome.response,
        session_id: outcome.session_id,
        intent: outcome.intent,
        requires_human_handoff: outcome.requires_human_handoff,
        suggested_actions: outcome.suggested_actions,
        confidence_score: outcome.confidence,
        processing_time_ms,
        correlation_id: outcome.correlation_id,
        degraded: outcome.degraded,
    };
    Ok((status, Json(body)).into_response())
}

/// `GET /session/{id}` - full session view.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let session_id = parse_session_id(&session_id)?;
    match state.engine.get_session(session_id).await {
        Ok(Some(session)) => Ok(Json(session).into_response()),
        Ok(None) => Err(session_not_found(session_id)),
        Err(e) => Err(map_engine_error(e)),
    }
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub session_id: Uuid,
    pub cleared: bool,
}

/// `DELETE /session/{id}` - destroy the session and cancel its work.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearedResponse>, (StatusCode, Json<ErrorResponse>)> {
    let session_id = parse_session_id(&session_id)?;
    match state.engine.delete_session(session_id).await {
        Ok(true) => Ok(Json(ClearedResponse {
            session_id,
            cleared: true,
        })),
        Ok(false) => Err(session_not_found(session_id)),
        Err(e) => Err(map_engine_error(e)),
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "session id must be a v4 UUID".into(),
                code: "VALIDATION",
            }),
        )
    })
}

fn session_not_found(session_id: Uuid) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("session {session_id} not found"),
            code: "SESSION_MISSING",
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub timestamp: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub session_store: &'static str,
    pub llm_providers: &'static str,
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let store_ok = state.engine.store_healthy().await;
    let providers_ok = state.engine.providers_configured();

    let status = if store_ok && providers_ok {
        "healthy"
    } else if providers_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    let body = HealthResponse {
        status,
        service: state.service_name.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        checks: HealthChecks {
            session_store: if store_ok { "healthy" } else { "unhealthy" },
            llm_providers: if providers_ok { "healthy" } else { "not_configured" },
        },
    };

    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

/// `GET /metrics`.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.metrics_snapshot().await).into_response()
}

/// `GET /ws/{session_id}` - upgrade to the session's push channel.
pub async fn push_channel(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
) -> Response {
    let client_ip = addr.ip();
    let session_id = match Uuid::parse_str(&session_id) {
        Ok(id) => id,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "session id must be a v4 UUID").into_response()
        }
    };

    let guard = match WebSocketGuard::new(state.rate_limiter.clone(), client_ip) {
        Some(guard) => guard,
        None => {
            warn!(ip = %client_ip, "WebSocket connection limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "connection limit exceeded").into_response();
        }
    };

    let hub = state.engine.hub().clone();
    ws.on_upgrade(move |socket| handle_push_socket(socket, hub, session_id, guard))
}

/// Bridge one WebSocket to the hub: outbound frames from the hub are
/// written to the socket; inbound client frames are accepted and ignored
/// (reserved for typing indicators).
async fn handle_push_socket(
    socket: axum::extract::ws::WebSocket,
    hub: Arc<PushHub>,
    session_id: Uuid,
    _guard: WebSocketGuard,
) {
    use axum::extract::ws::{CloseFrame, Message};

    info!(%session_id, "push channel connected");
    let (connection_id, mut frames) = hub.attach(session_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(PushFrame::Envelope(envelope)) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(%session_id, error = %e, "unserializable push envelope");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(PushFrame::Close { reason }) => {
                    debug!(%session_id, reason, "closing push channel");
                    let frame = CloseFrame {
                        code: 1000,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(%session_id, "push channel closed by client");
                    break;
                }
                Some(Ok(other)) => {
                    // Client frames are reserved for future use.
                    debug!(%session_id, frame = ?other, "ignoring client frame");
                }
                Some(Err(e)) => {
                    warn!(%session_id, error = %e, "push channel error");
                    break;
                }
            },
        }
    }

    hub.detach(session_id, connection_id);
    info!(%session_id, "push channel disconnected");
}
