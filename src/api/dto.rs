//! Wire-format DTOs for the HTTP surface. These mirror the persisted
//! `Message`/`Session` domain shapes but rename fields to the
//! `camelCase` vocabulary callers are given and drop server-internal
//! fields (e.g. the raw credential id).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Message, Session, TokenUsage};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(rename = "gameId")]
    pub game_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TokenUsageDto {
    pub input: i64,
    pub output: i64,
    pub total: i64,
}

impl From<TokenUsage> for TokenUsageDto {
    fn from(usage: TokenUsage) -> Self {
        Self { input: usage.input, output: usage.output, total: usage.total }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    pub id: Uuid,
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: String,
    pub plot: Option<String>,
    #[serde(rename = "statusFields")]
    pub status_fields: serde_json::Value,
    #[serde(rename = "imagePrompt")]
    pub image_prompt: Option<String>,
    #[serde(rename = "hasImage")]
    pub has_image: bool,
    #[serde(rename = "hasAudio")]
    pub has_audio: bool,
    pub stream: bool,
    #[serde(rename = "tokenUsage")]
    pub token_usage: TokenUsageDto,
    #[serde(rename = "promptStatusUpdate")]
    pub prompt_status_update: Option<String>,
    #[serde(rename = "promptExpandStory")]
    pub prompt_expand_story: Option<String>,
    #[serde(rename = "promptResponseSchema")]
    pub prompt_response_schema: Option<String>,
    #[serde(rename = "promptImageGeneration")]
    pub prompt_image_generation: Option<String>,
    #[serde(rename = "streamUrl")]
    pub stream_url: String,
}

impl MessageDto {
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            session_id: message.session_id,
            seq: message.seq,
            message_type: message.message_type.to_string(),
            message: message.body.clone(),
            plot: message.plot.clone(),
            status_fields: message.status_fields.clone(),
            image_prompt: message.image_prompt.clone(),
            has_image: message.has_image,
            has_audio: message.has_audio,
            stream: message.streaming,
            token_usage: message.token_usage.into(),
            prompt_status_update: message.prompt_status_update.clone(),
            prompt_expand_story: message.prompt_expand_story.clone(),
            prompt_response_schema: message.prompt_response_schema.clone(),
            prompt_image_generation: message.prompt_image_generation.clone(),
            stream_url: format!("/messages/{}/stream", message.id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDto {
    pub id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(rename = "gameId")]
    pub game_id: Uuid,
    pub name: String,
    pub description: String,
    pub theme: Option<serde_json::Value>,
    pub vendor: Option<String>,
    #[serde(rename = "qualityTier")]
    pub quality_tier: Option<String>,
    #[serde(rename = "orgUnverified")]
    pub org_unverified: bool,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
}

impl SessionDto {
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            game_id: session.game_id,
            name: session.name.clone(),
            description: session.description.clone(),
            theme: session.theme.clone(),
            vendor: session.vendor.clone(),
            quality_tier: session.quality_tier.clone(),
            org_unverified: session.org_unverified,
            error_message: session.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session: SessionDto,
    pub message: MessageDto,
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session: SessionDto,
    pub messages: Vec<MessageDto>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub code: String,
    pub message: String,
}
