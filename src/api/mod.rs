//! HTTP/SSE surface (C8): axum router, handlers, and the correlation-id
//! middleware, exposing the orchestrator's `CreateSession` /
//! `DoSessionAction` / `RetryImageGeneration` operations over HTTP.

mod dto;
mod error_response;
mod handlers;
pub mod http_server;
pub mod middleware;

pub use http_server::{AppState, create_router};
