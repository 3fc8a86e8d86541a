//! HTTP-backed vendor adapter for OpenAI-compatible chat completion APIs.
//!
//! A thin `reqwest::Client` wrapper with a generic exponential-backoff
//! retry helper that short-circuits on non-retryable auth errors, and
//! `#[instrument]`-annotated calls that wrap failures in
//! `anyhow::Context` before they reach the classifier.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{Credential, Game, Session, TokenUsage};
use crate::error::{OrchestratorError, classify_vendor_error};
use crate::streams::StreamHandle;

use super::traits::{ActionInput, ExecuteActionOutcome, ExpandStoryOutcome, ModelAdapter};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Retries `f` with exponential backoff, up to `MAX_RETRIES` times. Bails
/// out immediately on a credential-fatal error since retrying with the
/// same credential cannot help.
async fn retry_with_backoff<F, T, Fut>(credential_id: uuid::Uuid, mut f: F) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let classified = classify_vendor_error(credential_id, &err.to_string());
                if classified.is_credential_fatal() {
                    return Err(classified);
                }
                tracing::warn!(attempt, error = %err, "vendor call failed, retrying");
                last_err = Some(classified);
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or(OrchestratorError::AiError("retries exhausted".to_string())))
}

fn resolve_model(tier: &str) -> &'static str {
    match tier {
        "max" => "gpt-4.1",
        "low" => "gpt-4.1-mini",
        _ => "gpt-4.1-mini",
    }
}

/// `ai_session_state` is a JSON-encoded transcript of prior user/assistant
/// turns. Each `ExecuteAction`/`ExpandStory` call decodes it, replays it
/// ahead of the new turn so the vendor sees the running conversation, then
/// encodes the turn it just ran back into the returned state.
const MAX_TRANSCRIPT_TURNS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranscriptTurn {
    role: String,
    content: String,
}

fn decode_transcript(state: Option<&str>) -> Vec<TranscriptTurn> {
    state.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

fn encode_transcript(turns: &[TranscriptTurn]) -> String {
    serde_json::to_string(turns).unwrap_or_default()
}

/// Appends one user/assistant exchange, then drops the oldest turns once
/// the transcript exceeds `MAX_TRANSCRIPT_TURNS` exchanges.
fn push_turn(transcript: &mut Vec<TranscriptTurn>, user: String, assistant: String) {
    transcript.push(TranscriptTurn { role: "user".to_string(), content: user });
    transcript.push(TranscriptTurn { role: "assistant".to_string(), content: assistant });
    let max_entries = MAX_TRANSCRIPT_TURNS * 2;
    if transcript.len() > max_entries {
        let drop = transcript.len() - max_entries;
        transcript.drain(0..drop);
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

pub struct OpenAiCompatibleAdapter {
    http_client: reqwest::Client,
    base_url: String,
    vendor_tag: &'static str,
}

impl OpenAiCompatibleAdapter {
    #[must_use]
    pub fn new(vendor_tag: &'static str, base_url: impl Into<String>) -> Self {
        Self { http_client: reqwest::Client::new(), base_url: base_url.into(), vendor_tag }
    }

    #[tracing::instrument(skip(self, credential, messages), fields(vendor = self.vendor_tag))]
    async fn chat_completion(
        &self,
        credential: &Credential,
        tier: &str,
        messages: Vec<(&str, String)>,
    ) -> Result<(String, TokenUsage), OrchestratorError> {
        let model = resolve_model(tier);
        let url = format!("{}/chat/completions", self.base_url);
        let secret = credential.secret.clone();
        let credential_id = credential.id;
        let body_messages: Vec<ChatMessage<'_>> =
            messages.iter().map(|(role, content)| ChatMessage { role, content: content.clone() }).collect();

        retry_with_backoff(credential_id, || {
            let url = url.clone();
            let secret = secret.clone();
            let request = ChatRequest { model, messages: clone_messages(&body_messages), stream: false };
            async move {
                let response = reqwest::Client::new()
                    .post(&url)
                    .bearer_auth(&secret)
                    .json(&request)
                    .send()
                    .await
                    .map_err(anyhow::Error::from)?;
                let response = response.error_for_status().map_err(anyhow::Error::from)?;
                let parsed: ChatResponse = response.json().await.map_err(anyhow::Error::from)?;
                let content = parsed.choices.first().map(|c| c.message.content.clone()).unwrap_or_default();
                let usage = parsed
                    .usage
                    .map_or_else(TokenUsage::default, |u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                Ok((content, usage))
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, credential, messages, stream), fields(vendor = self.vendor_tag))]
    async fn chat_completion_streamed(
        &self,
        credential: &Credential,
        tier: &str,
        messages: Vec<(&str, String)>,
        stream: &StreamHandle,
    ) -> Result<(String, TokenUsage), OrchestratorError> {
        use futures::StreamExt as _;

        let model = resolve_model(tier);
        let url = format!("{}/chat/completions", self.base_url);
        let body_messages: Vec<ChatMessage<'_>> =
            messages.iter().map(|(role, content)| ChatMessage { role, content: content.clone() }).collect();
        let request = ChatRequest { model, messages: body_messages, stream: true };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&credential.secret)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_vendor_error(credential.id, &e.to_string()))?;
        let mut byte_stream = response.bytes_stream();
        let mut full = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| classify_vendor_error(credential.id, &e.to_string()))?;
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if let Some(delta) = line.strip_prefix("data: ") {
                    if delta == "[DONE]" {
                        continue;
                    }
                    if let Ok(value) = serde_json::from_str::<Value>(delta) {
                        if let Some(piece) = value["choices"][0]["delta"]["content"].as_str() {
                            full.push_str(piece);
                            stream.send_text(piece.to_string()).await;
                        }
                    }
                }
            }
        }
        Ok((full, TokenUsage::default()))
    }
}

fn clone_messages<'a>(messages: &[ChatMessage<'a>]) -> Vec<ChatMessage<'a>> {
    messages.iter().map(|m| ChatMessage { role: m.role, content: m.content.clone() }).collect()
}

#[async_trait]
impl ModelAdapter for OpenAiCompatibleAdapter {
    fn vendor_tag(&self) -> &'static str {
        self.vendor_tag
    }

    async fn execute_action(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        action: &ActionInput,
    ) -> Result<ExecuteActionOutcome, OrchestratorError> {
        let schema_keys: Vec<&str> = session.status_fields.iter().map(|f| f.name.as_str()).collect();
        let system = format!(
            "Respond with JSON only: {{\"message\": string(<=400 chars), \"status\": object with exactly keys {schema_keys:?}, \"imagePrompt\": string(<=250 chars)}}."
        );
        let mut transcript = decode_transcript(session.ai_session_state.as_deref());
        let mut messages: Vec<(&str, String)> = vec![("system", system)];
        for turn in &transcript {
            messages.push((turn.role.as_str(), turn.content.clone()));
        }
        messages.push(("user", action.body.clone()));

        let (content, usage) = self.chat_completion(credential, tier, messages).await?;
        let parsed: Value = serde_json::from_str(&content)
            .map_err(|e| OrchestratorError::AiError(format!("non-JSON structured reply: {e}")))?;
        let plot = parsed["message"].as_str().unwrap_or_default().to_string();
        let image_prompt = parsed["imagePrompt"].as_str().unwrap_or_default().to_string();
        let status_fields = parsed["status"].clone();

        push_turn(&mut transcript, action.body.clone(), content);
        Ok(ExecuteActionOutcome { plot, status_fields, image_prompt, usage, ai_session_state: encode_transcript(&transcript) })
    }

    async fn expand_story(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        plot: &str,
        language: &str,
        stream: &StreamHandle,
    ) -> Result<ExpandStoryOutcome, OrchestratorError> {
        let system =
            format!("Narrate the following plot outline in {language}, 3-6 sentences, no markdown, ending open.");
        let mut transcript = decode_transcript(session.ai_session_state.as_deref());
        let mut messages: Vec<(&str, String)> = vec![("system", system)];
        for turn in &transcript {
            messages.push((turn.role.as_str(), turn.content.clone()));
        }
        messages.push(("user", plot.to_string()));

        let (body, usage) = self.chat_completion_streamed(credential, tier, messages, stream).await?;

        push_turn(&mut transcript, plot.to_string(), body.clone());
        Ok(ExpandStoryOutcome { body, usage, ai_session_state: encode_transcript(&transcript) })
    }

    async fn generate_image(
        &self,
        _session: &Session,
        credential: &Credential,
        _tier: &str,
        image_prompt: &str,
        game: &Game,
        plot: &str,
        stream: &StreamHandle,
    ) -> Result<(), OrchestratorError> {
        let prompt = format!("{image_prompt}. Scene: {}. Style: {}. Context: {plot}", game.description, game.image_style);
        let url = format!("{}/images/generations", self.base_url);
        let credential_id = credential.id;
        let secret = credential.secret.clone();
        let bytes = retry_with_backoff(credential_id, move || {
            let url = url.clone();
            let secret = secret.clone();
            let prompt = prompt.clone();
            async move {
                let response = reqwest::Client::new()
                    .post(&url)
                    .bearer_auth(&secret)
                    .json(&json!({"prompt": prompt, "response_format": "b64_json"}))
                    .send()
                    .await
                    .map_err(anyhow::Error::from)?;
                let response = response.error_for_status().map_err(anyhow::Error::from)?;
                let parsed: Value = response.json().await.map_err(anyhow::Error::from)?;
                let b64 = parsed["data"][0]["b64_json"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("image response missing b64_json"))?
                    .to_string();
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.decode(b64).map_err(anyhow::Error::from)
            }
        })
        .await?;
        stream.send_image(bytes, true).await.map_err(OrchestratorError::ServerError)
    }

    async fn translate(
        &self,
        credential: &Credential,
        payloads: &HashMap<String, String>,
        target_lang: &str,
    ) -> Result<(HashMap<String, String>, TokenUsage), OrchestratorError> {
        let system = format!("Translate each JSON value to language code '{target_lang}'. Respond with a JSON object with the same keys.");
        let user = serde_json::to_string(payloads).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        let (content, usage) = self.chat_completion(credential, "balanced", vec![("system", system), ("user", user)]).await?;
        let parsed: HashMap<String, String> =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::AiError(format!("non-JSON translation: {e}")))?;
        Ok((parsed, usage))
    }

    async fn generate_theme(
        &self,
        credential: &Credential,
        tier: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, TokenUsage), OrchestratorError> {
        self.chat_completion(credential, tier, vec![("system", system_prompt.to_string()), ("user", user_prompt.to_string())]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_resolution_falls_back_to_balanced() {
        assert_eq!(resolve_model("max"), "gpt-4.1");
        assert_eq!(resolve_model("unknown-tier"), "gpt-4.1-mini");
    }

    #[test]
    fn transcript_round_trips_and_grows() {
        let mut transcript = decode_transcript(None);
        assert!(transcript.is_empty());

        push_turn(&mut transcript, "I open the door.".to_string(), "{\"message\": \"It creaks open.\"}".to_string());
        let state = encode_transcript(&transcript);

        let reloaded = decode_transcript(Some(&state));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].role, "user");
        assert_eq!(reloaded[1].role, "assistant");
    }

    #[test]
    fn transcript_drops_oldest_turns_past_the_cap() {
        let mut transcript = Vec::new();
        for i in 0..(MAX_TRANSCRIPT_TURNS + 5) {
            push_turn(&mut transcript, format!("action {i}"), format!("reply {i}"));
        }
        assert_eq!(transcript.len(), MAX_TRANSCRIPT_TURNS * 2);
        assert_eq!(transcript[0].content, format!("action {}", 5));
    }
}
