//! Route handlers: session lifecycle, the per-turn action endpoint, the
//! SSE stream, and the raw image/audio byte endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use uuid::Uuid;

use crate::adapter::{ActionInput, ActionKind};
use crate::error::OrchestratorError;
use crate::streams::StreamEvent;

use super::dto::{
    CreateSessionRequest, CreateSessionResponse, MessageDto, PostMessageRequest, SessionDetailResponse, SessionDto,
};
use super::error_response::ApiError;
use super::http_server::AppState;

/// `POST /sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let (session, message) = state.orchestrator.create_session(request.user_id, request.game_id).await?;
    let body = CreateSessionResponse {
        session: SessionDto::from_session(&session),
        message: MessageDto::from_message(&message),
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// `POST /sessions/{id}/messages`
pub async fn post_session_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<PostMessageRequest>,
) -> Result<Json<MessageDto>, ApiError> {
    let session = state.store.get_session(session_id).await?;
    let action = ActionInput { kind: ActionKind::Player, body: request.message };
    let message = state.orchestrator.do_session_action(session, action).await?;
    Ok(Json(MessageDto::from_message(&message)))
}

/// `GET /sessions/{id}`: also triggers a background image retry for any
/// non-streaming message that has an image prompt but no persisted image,
/// so a client that reloads picks up a retry without a new turn.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state.store.get_session(session_id).await?;
    let messages = state.store.list_messages(session_id).await?;

    for message in &messages {
        let missing_image = !message.streaming
            && !message.has_image
            && message.image_prompt.as_deref().is_some_and(|p| !p.is_empty());
        if missing_image {
            state.orchestrator.retry_image_generation(session.clone(), message.clone());
        }
    }

    Ok(Json(SessionDetailResponse {
        session: SessionDto::from_session(&session),
        messages: messages.iter().map(MessageDto::from_message).collect(),
    }))
}

fn frame_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Text(delta) => Event::default().event("text").data(delta),
        StreamEvent::Image { data, is_done } => {
            Event::default().event("image").data(json!({ "data": data, "isDone": is_done }).to_string())
        }
        StreamEvent::Audio { data, is_done } => {
            Event::default().event("audio").data(json!({ "data": data, "isDone": is_done }).to_string())
        }
        StreamEvent::Error { code, message } => {
            Event::default().event("error").data(json!({ "code": code, "message": message }).to_string())
        }
        StreamEvent::Done => Event::default().event("done").data(""),
    }
}

/// `GET /messages/{id}/stream`: SSE. Replays whatever is already buffered
/// for the message, then follows live events until `done`/`error`.
pub async fn stream_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state.streams.get(message_id).ok_or(OrchestratorError::NotFound)?;
    let (snapshot, receiver) = handle.attach().await;

    let live = stream::unfold(receiver, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((event, rx)),
            Err(_closed) => None,
        }
    });

    let events = stream::iter(snapshot).chain(live).map(|event| Ok(frame_event(event)));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// `GET /messages/{id}/image`
pub async fn get_message_image(State(state): State<AppState>, Path(message_id): Path<Uuid>) -> Result<Response, ApiError> {
    let bytes = state.store.load_image(message_id).await?.ok_or(OrchestratorError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// `GET /messages/{id}/audio`
pub async fn get_message_audio(State(state): State<AppState>, Path(message_id): Path<Uuid>) -> Result<Response, ApiError> {
    let bytes = state.store.load_audio(message_id).await?.ok_or(OrchestratorError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes).into_response())
}
