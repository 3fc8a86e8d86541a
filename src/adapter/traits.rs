//! The vendor-agnostic contract every model-platform adapter implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Credential, Game, Session, TokenUsage};
use crate::error::OrchestratorError;
use crate::streams::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Player,
    System,
}

/// One player or system action, paired with the session's conversation
/// state inside the adapter call.
#[derive(Debug, Clone)]
pub struct ActionInput {
    pub kind: ActionKind,
    pub body: String,
}

/// Result of `ExecuteAction`: the structured reply plus the updated
/// vendor-conversation state.
#[derive(Debug, Clone)]
pub struct ExecuteActionOutcome {
    /// Plot outline, ≤ 400 chars.
    pub plot: String,
    /// Object whose keys exactly match the game's status-field names.
    pub status_fields: Value,
    /// ≤ 250 chars; empty means "no image this turn".
    pub image_prompt: String,
    pub usage: TokenUsage,
    pub ai_session_state: String,
}

/// Result of `ExpandStory`.
#[derive(Debug, Clone)]
pub struct ExpandStoryOutcome {
    pub body: String,
    pub usage: TokenUsage,
    pub ai_session_state: String,
}

/// Uniform capability surface over one concrete model vendor. Quality
/// tiers (e.g. low/balanced/max) map to concrete vendor model identifiers
/// inside the implementation.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// The tag this adapter registers under (`session.vendor`).
    fn vendor_tag(&self) -> &'static str;

    /// Blocking: one player or system action in, a structured reply out.
    async fn execute_action(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        action: &ActionInput,
    ) -> Result<ExecuteActionOutcome, OrchestratorError>;

    /// Streaming: narrate the plot outline into 3-6 sentences of prose,
    /// emitting text deltas to `stream` as they arrive.
    async fn expand_story(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        plot: &str,
        language: &str,
        stream: &StreamHandle,
    ) -> Result<ExpandStoryOutcome, OrchestratorError>;

    /// Streaming: generate a scene illustration. The final image event
    /// must be preceded by `stream`'s persist callback completing.
    async fn generate_image(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        image_prompt: &str,
        game: &Game,
        plot: &str,
        stream: &StreamHandle,
    ) -> Result<(), OrchestratorError>;

    /// One-shot map-valued translation used during session creation.
    async fn translate(
        &self,
        credential: &Credential,
        payloads: &HashMap<String, String>,
        target_lang: &str,
    ) -> Result<(HashMap<String, String>, TokenUsage), OrchestratorError>;

    /// One-shot JSON theme generation.
    async fn generate_theme(
        &self,
        credential: &Credential,
        tier: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, TokenUsage), OrchestratorError>;
}
