//! Session Orchestrator (C5): creates sessions and drives the per-turn
//! three-phase pipeline described in the module doc comment.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{ActionInput, ActionKind, AdapterRegistry};
use crate::credential::{resolve_full, resolve_top};
use crate::domain::{Message, MessageType, Session, TokenUsage};
use crate::error::OrchestratorError;
use crate::locks::SessionLockRegistry;
use crate::streams::{PersistCallback, StreamRegistry};
use crate::store::Store;

use super::prompts::{
    GAME_START_INSTRUCTIONS, NARRATION_PROMPT, THEME_SYSTEM_PROMPT, action_as_json, build_response_schema,
    build_system_prompt, default_theme,
};

/// Everything C5 needs: a repository, the adapter registry, and the two
/// in-memory registries (C3, C4). Cheap to clone: every field is an `Arc`
/// or (for `AdapterRegistry`) a cloneable map of `Arc`s, so background
/// tasks can hold their own copy independent of the request that spawned
/// them.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    adapters: AdapterRegistry,
    streams: Arc<StreamRegistry>,
    locks: Arc<SessionLockRegistry>,
}

fn image_persist_cb(store: Arc<dyn Store>, message_id: Uuid) -> PersistCallback {
    Arc::new(move |bytes: Vec<u8>| {
        let store = Arc::clone(&store);
        Box::pin(async move { store.persist_image(message_id, bytes).await })
    })
}

fn audio_persist_cb(store: Arc<dyn Store>, message_id: Uuid) -> PersistCallback {
    Arc::new(move |bytes: Vec<u8>| {
        let store = Arc::clone(&store);
        Box::pin(async move { store.persist_audio(message_id, bytes).await })
    })
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        adapters: AdapterRegistry,
        streams: Arc<StreamRegistry>,
        locks: Arc<SessionLockRegistry>,
    ) -> Self {
        Self { store, adapters, streams, locks }
    }

    /// 4.5.1: resolve a credential, snapshot the game, build the session,
    /// then drive the first turn as a system action.
    #[instrument(skip(self), fields(user_id = %user_id, game_id = %game_id))]
    pub async fn create_session(&self, user_id: Uuid, game_id: Uuid) -> Result<(Session, Message), OrchestratorError> {
        let inputs = self.store.credential_resolution_inputs(user_id, game_id).await?;
        let top = resolve_top(&inputs)?;

        let mut game = self.store.load_game(game_id).await?;
        self.store.delete_sessions_for_user_game(user_id, game_id).await?;
        let user = self.store.load_user(user_id).await?;

        let credential = self.store.get_credential(top.credential_id).await?;
        let adapter = self.adapters.get(&top.vendor)?;

        let theme_task = async {
            if let Some(theme) = game.theme.clone() {
                (theme, TokenUsage::default())
            } else {
                match adapter.generate_theme(&credential, &top.tier, THEME_SYSTEM_PROMPT, &game.scenario).await {
                    Ok((raw, usage)) => (serde_json::from_str(&raw).unwrap_or_else(|_| default_theme()), usage),
                    Err(err) => {
                        warn!(error = %err, "theme generation failed, falling back to default theme");
                        (default_theme(), TokenUsage::default())
                    }
                }
            }
        };

        let translate_task = async {
            if !user.wants_translation() {
                return (None, TokenUsage::default());
            }
            let mut payload = HashMap::new();
            payload.insert("name".to_string(), game.name.clone());
            payload.insert("description".to_string(), game.description.clone());
            payload.insert("scenario".to_string(), game.scenario.clone());
            payload.insert("game_start".to_string(), GAME_START_INSTRUCTIONS.to_string());
            for field in &game.status_fields {
                payload.insert(format!("status:{}", field.name), field.name.clone());
            }
            match adapter.translate(&credential, &payload, &user.language).await {
                Ok((translated, usage)) => (Some(translated), usage),
                Err(err) => {
                    warn!(error = %err, "translation failed, keeping original language");
                    (None, TokenUsage::default())
                }
            }
        };

        let ((theme, theme_usage), (translated, translate_usage)) = tokio::join!(theme_task, translate_task);
        let usage = theme_usage + translate_usage;

        if let Some(translated) = translated {
            if let Some(v) = translated.get("name") {
                game.name = v.clone();
            }
            if let Some(v) = translated.get("description") {
                game.description = v.clone();
            }
            if let Some(v) = translated.get("scenario") {
                game.scenario = v.clone();
            }
            for field in &mut game.status_fields {
                if let Some(v) = translated.get(&format!("status:{}", field.name)) {
                    field.name = v.clone();
                }
            }
        }

        let system_prompt = build_system_prompt(&game, &user.language);

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            game_id,
            name: game.name.clone(),
            description: game.description.clone(),
            image_style: game.image_style.clone(),
            status_fields: game.status_fields.clone(),
            theme: Some(theme),
            credential_id: Some(top.credential_id),
            vendor: Some(top.vendor.clone()),
            quality_tier: Some(top.tier.clone()),
            ai_session_state: None,
            org_unverified: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_session(&session).await?;

        // Seq=0 is the system prompt row; seq=1 (assigned by the repository
        // next) is the placeholder `DoSessionAction` below creates. This is
        // the chosen resolution for an underspecified ordering: the system
        // action itself is never re-persisted by `do_session_action`, only
        // player actions are.
        self.store
            .create_message(Message {
                id: Uuid::new_v4(),
                session_id: session.id,
                seq: -1,
                message_type: MessageType::System,
                body: system_prompt.clone(),
                status_fields: json!({}),
                plot: None,
                image_prompt: None,
                has_image: false,
                has_audio: false,
                streaming: false,
                token_usage: TokenUsage::default(),
                prompt_status_update: None,
                prompt_expand_story: None,
                prompt_response_schema: None,
                prompt_image_generation: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let system_action = ActionInput { kind: ActionKind::System, body: system_prompt };
        match self.do_session_action(session.clone(), system_action).await {
            Ok(mut response) => {
                response.token_usage += usage;
                self.store.update_message(&response).await?;
                Ok((session, response))
            }
            Err(err) => {
                self.store.delete_session(session.id).await.ok();
                Err(err)
            }
        }
    }

    /// 4.5.2: validate, re-resolve, serialize via C3, run Phase 1 inline,
    /// then detach Phases 2 and 3 into background tasks.
    #[instrument(skip(self, action), fields(session_id = %session.id))]
    pub async fn do_session_action(
        &self,
        mut session: Session,
        action: ActionInput,
    ) -> Result<Message, OrchestratorError> {
        if session.credential_id.is_none() {
            return Err(OrchestratorError::NoApiKey);
        }

        let game = self.store.load_game(session.game_id).await?;
        let user = self.store.load_user(session.user_id).await?;
        let inputs = self.store.credential_resolution_inputs(session.user_id, session.game_id).await?;
        let candidates = resolve_full(&inputs)?;

        let guard = self.locks.lock(session.id).await;

        // `resolve_full` never returns an empty, Ok list, so indexing by
        // `attempt` is always in range on entry; the only way to advance
        // past the end is through the exhaustion branch below, which
        // returns before looping again.
        let mut attempt = 0usize;
        loop {
            let candidate = &candidates[attempt];
            session.credential_id = Some(candidate.credential_id);
            session.vendor = Some(candidate.vendor.clone());
            session.quality_tier = Some(candidate.tier.clone());

            let mut player_message_id = None;
            if action.kind == ActionKind::Player {
                let now = Utc::now();
                let saved = self
                    .store
                    .create_message(Message {
                        id: Uuid::new_v4(),
                        session_id: session.id,
                        seq: -1,
                        message_type: MessageType::Player,
                        body: action.body.clone(),
                        status_fields: json!({}),
                        plot: None,
                        image_prompt: None,
                        has_image: false,
                        has_audio: false,
                        streaming: false,
                        token_usage: TokenUsage::default(),
                        prompt_status_update: None,
                        prompt_expand_story: None,
                        prompt_response_schema: None,
                        prompt_image_generation: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                player_message_id = Some(saved.id);
            }

            let now = Utc::now();
            let placeholder = self
                .store
                .create_message(Message {
                    id: Uuid::new_v4(),
                    session_id: session.id,
                    seq: -1,
                    message_type: MessageType::Game,
                    body: String::new(),
                    status_fields: json!({}),
                    plot: None,
                    image_prompt: None,
                    has_image: false,
                    has_audio: false,
                    streaming: true,
                    token_usage: TokenUsage::default(),
                    prompt_status_update: None,
                    prompt_expand_story: None,
                    prompt_response_schema: None,
                    prompt_image_generation: None,
                    created_at: now,
                    updated_at: now,
                })
                .await?;

            let stream = self.streams.create(
                placeholder.id,
                Some(image_persist_cb(Arc::clone(&self.store), placeholder.id)),
                Some(audio_persist_cb(Arc::clone(&self.store), placeholder.id)),
            );

            let credential = self.store.get_credential(candidate.credential_id).await?;
            let adapter = self.adapters.get(&candidate.vendor)?;

            match adapter.execute_action(&session, &credential, &candidate.tier, &action).await {
                Ok(outcome) => {
                    let mut response = placeholder;
                    response.plot = Some(outcome.plot.clone());
                    response.status_fields = outcome.status_fields;
                    response.image_prompt = Some(outcome.image_prompt.clone());
                    response.token_usage = outcome.usage;
                    response.prompt_status_update = Some(action_as_json(&action));
                    response.prompt_expand_story = Some(NARRATION_PROMPT.to_string());
                    response.prompt_response_schema = Some(build_response_schema(&session.status_fields));
                    response.prompt_image_generation = Some(outcome.image_prompt.clone());
                    self.store.update_message(&response).await?;
                    self.store.update_session(&session).await?;

                    let message_id = response.id;
                    let language = user.language.clone();
                    let plot = outcome.plot;
                    let image_prompt = outcome.image_prompt;
                    let tier = candidate.tier.clone();

                    {
                        let session = session.clone();
                        let credential = credential.clone();
                        let adapter = Arc::clone(&adapter);
                        let store = Arc::clone(&self.store);
                        let stream = Arc::clone(&stream);
                        let language = language.clone();
                        let plot = plot.clone();
                        let tier = tier.clone();
                        let guard = guard;
                        tokio::spawn(async move {
                            run_narration(&adapter, &store, &stream, session, credential, &tier, &plot, &language, message_id)
                                .await;
                            guard.release();
                        });
                    }

                    {
                        let session = session.clone();
                        let game = game.clone();
                        let credential = credential.clone();
                        let adapter = Arc::clone(&adapter);
                        let store = Arc::clone(&self.store);
                        let streams = Arc::clone(&self.streams);
                        let stream = Arc::clone(&stream);
                        let tier = tier.clone();
                        tokio::spawn(async move {
                            run_image(&adapter, &store, &streams, &stream, session, game, credential, &tier, &image_prompt, &plot, message_id)
                                .await;
                        });
                    }

                    return Ok(response);
                }
                Err(err) => {
                    stream.send_error(err.code(), err.to_string()).await;
                    self.store.delete_message(placeholder.id).await.ok();
                    self.streams.remove(placeholder.id);
                    if let Some(pid) = player_message_id.take() {
                        self.store.delete_message(pid).await.ok();
                    }
                    if let Some(credential_id) = err.fatal_credential_id() {
                        self.store.update_credential_last_usage(credential_id, false).await.ok();
                    }
                    if err.is_credential_fatal() {
                        attempt += 1;
                        if attempt >= candidates.len() {
                            self.store.clear_session_credential(session.id).await?;
                            if game.sponsor_credential_id == err.fatal_credential_id() {
                                self.store.remove_game_sponsorship(game.id).await?;
                                guard.release();
                                return Err(OrchestratorError::SponsoredApiKeyNotWorking);
                            }
                            guard.release();
                            return Err(err);
                        }
                        continue;
                    }
                    guard.release();
                    return Err(err);
                }
            }
        }
    }

    /// 4.5.3: background, fire-and-forget retry for a message that has an
    /// image prompt but no persisted image.
    #[instrument(skip(self, session, message), fields(session_id = %session.id, message_id = %message.id))]
    pub fn retry_image_generation(&self, session: Session, message: Message) {
        let Some(credential_id) = session.credential_id else { return };
        let Some(image_prompt) = message.image_prompt.clone().filter(|p| !p.is_empty()) else { return };
        if session.images_disabled() {
            return;
        }
        if self.streams.get(message.id).is_some() {
            return;
        }
        let Some(vendor) = session.vendor.clone() else { return };
        let Ok(adapter) = self.adapters.get(&vendor) else { return };

        let store = Arc::clone(&self.store);
        let streams = Arc::clone(&self.streams);
        let message_id = message.id;
        let tier = session.quality_tier.clone().unwrap_or_else(|| "balanced".to_string());
        let plot = message.plot.clone().unwrap_or_default();

        tokio::spawn(async move {
            let Ok(game) = store.load_game(session.game_id).await else { return };
            let Ok(credential) = store.get_credential(credential_id).await else { return };
            let stream = streams.create(message_id, Some(image_persist_cb(Arc::clone(&store), message_id)), None);
            if let Err(err) =
                adapter.generate_image(&session, &credential, &tier, &image_prompt, &game, &plot, stream.as_ref()).await
            {
                warn!(error = %err, "retried image generation failed");
            }
            streams.remove(message_id);
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_narration(
    adapter: &Arc<dyn crate::adapter::ModelAdapter>,
    store: &Arc<dyn Store>,
    stream: &Arc<crate::streams::StreamHandle>,
    session: Session,
    credential: crate::domain::Credential,
    tier: &str,
    plot: &str,
    language: &str,
    message_id: Uuid,
) {
    match adapter.expand_story(&session, &credential, tier, plot, language, stream.as_ref()).await {
        Ok(outcome) => {
            if let Ok(mut message) = store.get_message(message_id).await {
                message.body = outcome.body;
                message.streaming = false;
                message.token_usage += outcome.usage;
                if let Err(err) = store.update_message(&message).await {
                    warn!(error = %err, "failed to persist narration");
                }
            }
            if let Err(err) = store.update_session_vendor_state(session.id, Some(outcome.ai_session_state)).await {
                warn!(error = %err, "failed to persist vendor state");
            }
            stream.send_done().await;
        }
        Err(err) => {
            stream.send_error(err.code(), err.to_string()).await;
            if let Ok(mut message) = store.get_message(message_id).await {
                message.streaming = false;
                let _ = store.update_message(&message).await;
            }
            info!(error = %err, "narration failed, turn stays with plot only");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_image(
    adapter: &Arc<dyn crate::adapter::ModelAdapter>,
    store: &Arc<dyn Store>,
    streams: &Arc<StreamRegistry>,
    stream: &Arc<crate::streams::StreamHandle>,
    session: Session,
    game: crate::domain::Game,
    credential: crate::domain::Credential,
    tier: &str,
    image_prompt: &str,
    plot: &str,
    message_id: Uuid,
) {
    if image_prompt.is_empty() || session.images_disabled() {
        streams.remove(message_id);
        return;
    }
    if let Err(err) = adapter.generate_image(&session, &credential, tier, image_prompt, &game, plot, stream.as_ref()).await {
        if matches!(err, OrchestratorError::OrgVerificationRequired) {
            let _ = store.set_session_org_unverified(session.id, true).await;
        } else if err.is_credential_fatal() {
            let _ = store.clear_session_credential(session.id).await;
        }
        warn!(error = %err, "image generation failed, not retried this turn");
    }
    streams.remove(message_id);
}
