//! Axum router and shared application state.

use std::sync::Arc;

use axum::Router;
use axum::middleware as axum_middleware;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::streams::StreamRegistry;

use super::handlers;
use super::middleware::correlation_id_middleware;

/// Shared state for every HTTP handler. `store` and `streams` are the same
/// `Arc`s the `Orchestrator` itself holds, so a handler can read repository
/// state or attach to a live stream without going through the orchestrator.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn Store>,
    pub streams: Arc<StreamRegistry>,
}

/// Builds the full router: session lifecycle, per-message SSE stream, and
/// raw image/audio byte endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", axum::routing::post(handlers::create_session))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/messages", axum::routing::post(handlers::post_session_message))
        .route("/messages/{id}/stream", get(handlers::stream_message))
        .route("/messages/{id}/image", get(handlers::get_message_image))
        .route("/messages/{id}/audio", get(handlers::get_message_audio))
        .layer(axum_middleware::from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
