//! End-to-end coverage of the session orchestrator against the in-memory
//! repository and a deterministic mock vendor adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use gamemaster_orchestrator::adapter::mock::MockAdapter;
use gamemaster_orchestrator::adapter::{
    ActionInput, ActionKind, AdapterRegistry, ExecuteActionOutcome, ExpandStoryOutcome, ModelAdapter,
};
use gamemaster_orchestrator::domain::{Credential, Game, MessageType, Session, StatusField, SystemSettings, TokenUsage, User, UserRole};
use gamemaster_orchestrator::error::OrchestratorError;
use gamemaster_orchestrator::locks::SessionLockRegistry;
use gamemaster_orchestrator::orchestrator::Orchestrator;
use gamemaster_orchestrator::store::{MemoryStore, Store};
use gamemaster_orchestrator::streams::{StreamHandle, StreamRegistry};

fn game(id: Uuid, sponsor_credential_id: Option<Uuid>) -> Game {
    let now = Utc::now();
    Game {
        id,
        name: "The Sunken Keep".into(),
        description: "A flooded fortress".into(),
        scenario: "Explore the keep before the tide returns.".into(),
        status_fields: vec![StatusField { name: "health".into() }, StatusField { name: "torchlight".into() }],
        image_style: "painterly".into(),
        theme: Some(serde_json::json!({"palette": "teal", "emoji": {}})),
        sponsor_credential_id,
        created_at: now,
        updated_at: now,
    }
}

fn user(id: Uuid, role: UserRole, default_credential_id: Option<Uuid>) -> User {
    let now = Utc::now();
    User { id, language: "en".into(), default_credential_id, role, deleted_at: None, created_at: now, updated_at: now }
}

fn credential(id: Uuid, vendor: &str) -> Credential {
    let now = Utc::now();
    Credential {
        id,
        owner_user_id: Uuid::new_v4(),
        vendor: vendor.into(),
        secret: "sk-test".into(),
        display_name: "test credential".into(),
        last_usage_success: None,
        created_at: now,
        updated_at: now,
    }
}

fn orchestrator(store: Arc<MemoryStore>, adapters: AdapterRegistry) -> Orchestrator {
    let store: Arc<dyn Store> = store;
    Orchestrator::new(store, adapters, Arc::new(StreamRegistry::new()), SessionLockRegistry::new())
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true within the test's deadline");
}

/// Delegates to an inner `MockAdapter` for everything except
/// `execute_action`, which fails with `InvalidApiKey` for one marked
/// credential id. Lets tests exercise Phase 1's fallback-retry loop and
/// the sponsor-removal path without a real vendor.
struct FlakyAdapter {
    inner: MockAdapter,
    bad_credential_id: Uuid,
}

#[async_trait]
impl ModelAdapter for FlakyAdapter {
    fn vendor_tag(&self) -> &'static str {
        "mock"
    }

    async fn execute_action(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        action: &ActionInput,
    ) -> Result<ExecuteActionOutcome, OrchestratorError> {
        if credential.id == self.bad_credential_id {
            return Err(OrchestratorError::InvalidApiKey { credential_id: credential.id });
        }
        self.inner.execute_action(session, credential, tier, action).await
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
        self.inner.expand_story(session, credential, tier, plot, language, stream).await
    }

    async fn generate_image(
        &self,
        session: &Session,
        credential: &Credential,
        tier: &str,
        image_prompt: &str,
        game: &Game,
        plot: &str,
        stream: &StreamHandle,
    ) -> Result<(), OrchestratorError> {
        self.inner.generate_image(session, credential, tier, image_prompt, game, plot, stream).await
    }

    async fn translate(
        &self,
        credential: &Credential,
        payloads: &HashMap<String, String>,
        target_lang: &str,
    ) -> Result<(HashMap<String, String>, TokenUsage), OrchestratorError> {
        self.inner.translate(credential, payloads, target_lang).await
    }

    async fn generate_theme(
        &self,
        credential: &Credential,
        tier: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, TokenUsage), OrchestratorError> {
        self.inner.generate_theme(credential, tier, system_prompt, user_prompt).await
    }
}

#[tokio::test]
async fn happy_path_assigns_seq_and_eventually_has_image() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let credential_id = Uuid::new_v4();

    store.insert_user(user(user_id, UserRole::None, Some(credential_id)));
    store.insert_game(game(game_id, None));
    store.insert_credential(credential(credential_id, "mock"));
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::new()));
    let orchestrator = orchestrator(Arc::clone(&store), adapters);

    let (session, first_message) = orchestrator.create_session(user_id, game_id).await.unwrap();

    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let messages = store_dyn.list_messages(session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].seq, 0);
    assert_eq!(messages[0].message_type, MessageType::System);
    assert_eq!(messages[1].seq, 1);
    assert_eq!(messages[1].message_type, MessageType::Game);
    assert_eq!(messages[1].id, first_message.id);

    wait_for(|| async {
        let Ok(m) = store_dyn.get_message(first_message.id).await else { return false };
        m.has_image && !m.streaming
    })
    .await;
}

#[tokio::test]
async fn participant_without_workshop_credential_gets_no_api_key() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let workshop_id = Uuid::new_v4();
    let institution_credential_id = Uuid::new_v4();

    store.insert_user(user(user_id, UserRole::WorkshopGuest { workshop_id }, None));
    store.insert_game(game(game_id, None));
    store.insert_credential(credential(institution_credential_id, "mock"));
    store.set_institution_credential(user_id, institution_credential_id);
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::new()));
    let orchestrator = orchestrator(Arc::clone(&store), adapters);

    let err = orchestrator.create_session(user_id, game_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoApiKey));
}

#[tokio::test]
async fn fallback_skips_invalid_credential_and_marks_it_unusable() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let bad_credential_id = Uuid::new_v4();
    let good_credential_id = Uuid::new_v4();

    // Sponsor candidate (priority 2) is the broken one; the user's default
    // credential (priority 4) is the working fallback.
    store.insert_user(user(user_id, UserRole::None, Some(good_credential_id)));
    store.insert_game(game(game_id, Some(bad_credential_id)));
    store.insert_credential(credential(bad_credential_id, "mock"));
    store.insert_credential(credential(good_credential_id, "mock"));
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(FlakyAdapter { inner: MockAdapter::new(), bad_credential_id }));
    let orchestrator = orchestrator(Arc::clone(&store), adapters);

    let (session, message) = orchestrator.create_session(user_id, game_id).await.unwrap();
    assert_eq!(session.credential_id, Some(good_credential_id));
    assert!(!message.body.is_empty() || message.plot.is_some());

    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let bad = store_dyn.get_credential(bad_credential_id).await.unwrap();
    assert_eq!(bad.last_usage_success, Some(false));
}

#[tokio::test]
async fn sponsor_credential_exhausted_clears_sponsorship() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let bad_credential_id = Uuid::new_v4();

    store.insert_user(user(user_id, UserRole::None, None));
    let mut sponsored_game = game(game_id, Some(bad_credential_id));
    sponsored_game.sponsor_credential_id = Some(bad_credential_id);
    store.insert_game(sponsored_game);
    store.insert_credential(credential(bad_credential_id, "mock"));
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(FlakyAdapter { inner: MockAdapter::new(), bad_credential_id }));
    let orchestrator = orchestrator(Arc::clone(&store), adapters);

    let err = orchestrator.create_session(user_id, game_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SponsoredApiKeyNotWorking));

    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let reloaded_game = store_dyn.load_game(game_id).await.unwrap();
    assert_eq!(reloaded_game.sponsor_credential_id, None);
}

#[tokio::test]
async fn get_session_retries_image_generation_for_a_message_missing_one() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let credential_id = Uuid::new_v4();

    store.insert_user(user(user_id, UserRole::None, Some(credential_id)));
    store.insert_game(game(game_id, None));
    store.insert_credential(credential(credential_id, "mock"));
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::new()));
    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let streams = Arc::new(StreamRegistry::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store_dyn), adapters, Arc::clone(&streams), SessionLockRegistry::new());

    let (session, message) = orchestrator.create_session(user_id, game_id).await.unwrap();

    // Simulate a turn whose image generation never completed: clear the
    // has_image flag the background task already set, as if the process
    // restarted mid-generation.
    let mut message = store_dyn.get_message(message.id).await.unwrap();
    message.has_image = false;
    message.streaming = false;
    store_dyn.update_message(&message).await.unwrap();

    orchestrator.retry_image_generation(session.clone(), message.clone());
    wait_for(|| async { streams.get(message.id).is_none() }).await;

    let reloaded = store_dyn.get_message(message.id).await.unwrap();
    assert!(reloaded.has_image);
}

#[tokio::test]
async fn cross_turn_state_chains_through_sequential_actions() {
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let game_id = Uuid::new_v4();
    let credential_id = Uuid::new_v4();

    store.insert_user(user(user_id, UserRole::None, Some(credential_id)));
    store.insert_game(game(game_id, None));
    store.insert_credential(credential(credential_id, "mock"));
    store.set_system_settings(SystemSettings { fallback_credential_id: None, default_quality_tier: "balanced".into() });

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::new()));
    let orchestrator = orchestrator(Arc::clone(&store), adapters);

    let (session, _first) = orchestrator.create_session(user_id, game_id).await.unwrap();
    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;

    wait_for(|| async { store_dyn.get_session(session.id).await.is_ok_and(|s| s.ai_session_state.is_some()) }).await;
    let session = store_dyn.get_session(session.id).await.unwrap();
    let first_state = session.ai_session_state.clone();

    let action = ActionInput { kind: ActionKind::Player, body: "I light the torch.".into() };
    let second = orchestrator.do_session_action(session.clone(), action).await.unwrap();
    assert!(second.plot.is_some());

    let first_state_for_wait = first_state.clone();
    wait_for(|| {
        let first_state = first_state_for_wait.clone();
        async move { store_dyn.get_session(session.id).await.is_ok_and(|s| s.ai_session_state != first_state) }
    })
    .await;
}
