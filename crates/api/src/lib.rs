//! HTTP/WebSocket gateway for the Carelink orchestrator.
//!
//! # Endpoints
//!
//! - `POST /chat` - synchronous request endpoint (provisional response)
//! - `GET /session/{id}` / `DELETE /session/{id}` - session read/delete
//! - `GET /health` - liveness and dependency checks
//! - `GET /metrics` - counters for the admin surface
//! - `GET /ws/{session_id}` - push channel upgrade

pub mod rate_limit;
pub mod routes;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/chat", post(routes::chat))
        .route(
            "/session/{id}",
            get(routes::get_session).delete(routes::delete_session),
        )
        .route("/ws/{session_id}", get(routes::push_channel))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until the process exits.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = create_router(state);

    info!(%addr, "starting Carelink API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
