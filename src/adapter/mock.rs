//! A fully in-memory vendor adapter used for tests and as the default
//! vendor for sessions created without a real credential configured.
//! Deterministic, hand-built responses rather than canned fixtures, so
//! cross-turn state chaining and status-field shape stay easy to assert on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::{Credential, Game, Session, TokenUsage};
use crate::error::OrchestratorError;
use crate::streams::StreamHandle;

use super::traits::{ActionInput, ExecuteActionOutcome, ExpandStoryOutcome, ModelAdapter};

/// One call recorded for a session, in call order, so tests can assert on
/// cross-turn ordering and state-chaining without inspecting internals.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub session_id: uuid::Uuid,
    pub incoming_state: Option<String>,
}

#[derive(Default)]
pub struct MockAdapter {
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn next_state(previous: Option<&str>) -> String {
        let n: u64 = previous.and_then(|s| s.parse().ok()).unwrap_or(0);
        (n + 1).to_string()
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn vendor_tag(&self) -> &'static str {
        "mock"
    }

    async fn execute_action(
        &self,
        session: &Session,
        _credential: &Credential,
        _tier: &str,
        action: &ActionInput,
    ) -> Result<ExecuteActionOutcome, OrchestratorError> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedCall { session_id: session.id, incoming_state: session.ai_session_state.clone() });

        let mut status = serde_json::Map::new();
        for field in &session.status_fields {
            status.insert(field.name.clone(), Value::String("nominal".to_string()));
        }

        Ok(ExecuteActionOutcome {
            plot: format!("The party responds to: {}", action.body),
            status_fields: Value::Object(status),
            image_prompt: "a torch-lit stone corridor, painterly style".to_string(),
            usage: TokenUsage::new(42, 18),
            ai_session_state: Self::next_state(session.ai_session_state.as_deref()),
        })
    }

    async fn expand_story(
        &self,
        session: &Session,
        _credential: &Credential,
        _tier: &str,
        plot: &str,
        _language: &str,
        stream: &StreamHandle,
    ) -> Result<ExpandStoryOutcome, OrchestratorError> {
        let sentences = [
            format!("{plot}."),
            "The air grows still as the echoes fade.".to_string(),
            "Something ahead refuses to be seen clearly.".to_string(),
        ];
        for sentence in &sentences {
            stream.send_text(format!("{sentence} ")).await;
        }
        Ok(ExpandStoryOutcome {
            body: sentences.join(" "),
            usage: TokenUsage::new(30, 60),
            ai_session_state: Self::next_state(session.ai_session_state.as_deref()),
        })
    }

    async fn generate_image(
        &self,
        _session: &Session,
        _credential: &Credential,
        _tier: &str,
        _image_prompt: &str,
        _game: &Game,
        _plot: &str,
        stream: &StreamHandle,
    ) -> Result<(), OrchestratorError> {
        stream.send_image(vec![0xFF, 0xD8], false).await.map_err(OrchestratorError::ServerError)?;
        stream.send_image(vec![0xFF, 0xD8, 0xFF, 0xD9], true).await.map_err(OrchestratorError::ServerError)?;
        Ok(())
    }

    async fn translate(
        &self,
        _credential: &Credential,
        payloads: &HashMap<String, String>,
        target_lang: &str,
    ) -> Result<(HashMap<String, String>, TokenUsage), OrchestratorError> {
        let translated =
            payloads.iter().map(|(k, v)| (k.clone(), format!("{v} ({target_lang})"))).collect();
        Ok((translated, TokenUsage::new(20, 20)))
    }

    async fn generate_theme(
        &self,
        _credential: &Credential,
        _tier: &str,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<(String, TokenUsage), OrchestratorError> {
        Ok((json!({"palette": "default", "emoji": {}}).to_string(), TokenUsage::new(15, 25)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StatusField;
    use chrono::Utc;
    use uuid::Uuid;

    fn session() -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            game_id: Uuid::new_v4(),
            name: "Test".into(),
            description: String::new(),
            image_style: "fantasy".into(),
            status_fields: vec![StatusField { name: "health".into() }],
            theme: None,
            credential_id: None,
            vendor: None,
            quality_tier: None,
            ai_session_state: None,
            org_unverified: false,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn credential() -> Credential {
        Credential {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            vendor: "mock".into(),
            secret: "s".into(),
            display_name: "d".into(),
            last_usage_success: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn state_chains_across_calls() {
        let adapter = MockAdapter::new();
        let mut sess = session();
        let cred = credential();
        let action = ActionInput { kind: super::super::traits::ActionKind::System, body: "begin".into() };

        let first = adapter.execute_action(&sess, &cred, "balanced", &action).await.unwrap();
        assert_eq!(first.ai_session_state, "1");

        sess.ai_session_state = Some(first.ai_session_state);
        let second = adapter.execute_action(&sess, &cred, "balanced", &action).await.unwrap();
        assert_eq!(second.ai_session_state, "2");

        let calls = adapter.recorded_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].incoming_state.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn status_fields_match_schema_keys() {
        let adapter = MockAdapter::new();
        let sess = session();
        let cred = credential();
        let action = ActionInput { kind: super::super::traits::ActionKind::Player, body: "go north".into() };
        let out = adapter.execute_action(&sess, &cred, "balanced", &action).await.unwrap();
        assert!(out.status_fields.get("health").is_some());
    }
}
