//! Session and streaming engine for an AI game-master text-adventure
//! platform: resolves which credential to use for a user+game, creates
//! and persists sessions, drives the structured-reply / narration / image
//! turn pipeline, and fans out live output over server-sent events.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// HTTP/SSE surface: axum router, handlers, and the correlation-id
/// middleware.
pub mod api;
/// Model-Platform Adapter (C1): vendor-agnostic chat/image/translation
/// capability surface.
pub mod adapter;
/// Credential Resolver (C2): five-priority candidate chain.
pub mod credential;
/// Core domain entities shared by every component.
pub mod domain;
/// Closed error taxonomy (C6) and vendor error classification.
pub mod error;
/// Session Lock Registry (C3): keyed, reference-counted per-session mutex.
pub mod locks;
/// Observability infrastructure: correlation ids and tracing setup.
pub mod observability;
/// Session Orchestrator (C5): session creation and the per-turn pipeline.
pub mod orchestrator;
/// Repository Interface (C7): narrow storage contract, with sqlite and
/// in-memory implementations.
pub mod store;
/// Stream Registry (C4): per-message live SSE event channel.
pub mod streams;
