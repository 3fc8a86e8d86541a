//! In-memory repository implementation used by tests and as a drop-in
//! alternative to the sqlite-backed store: deterministic, fast, and
//! explicit about the fixtures a test wires in.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::credential::{CredentialSource, ResolutionInputs};
use crate::domain::{Credential, Game, Message, Session, SystemSettings, User};
use crate::error::OrchestratorError;

use super::Store;

#[derive(Default, Clone)]
struct UserFixture {
    workshop_credential_id: Option<Uuid>,
    institution_credential_id: Option<Uuid>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, Session>,
    messages: HashMap<Uuid, Message>,
    next_seq: HashMap<Uuid, i64>,
    games: HashMap<Uuid, Game>,
    users: HashMap<Uuid, User>,
    credentials: HashMap<Uuid, Credential>,
    system_settings: SystemSettings,
    images: HashMap<Uuid, Vec<u8>>,
    audios: HashMap<Uuid, Vec<u8>>,
    fixtures: HashMap<Uuid, UserFixture>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    pub fn insert_game(&self, game: Game) {
        self.lock().games.insert(game.id, game);
    }

    pub fn insert_credential(&self, credential: Credential) {
        self.lock().credentials.insert(credential.id, credential);
    }

    pub fn set_system_settings(&self, settings: SystemSettings) {
        self.lock().system_settings = settings;
    }

    pub fn set_workshop_credential(&self, user_id: Uuid, credential_id: Uuid) {
        self.lock().fixtures.entry(user_id).or_default().workshop_credential_id = Some(credential_id);
    }

    pub fn set_institution_credential(&self, user_id: Uuid, credential_id: Uuid) {
        self.lock().fixtures.entry(user_id).or_default().institution_credential_id = Some(credential_id);
    }

    pub fn clear_workshop_credential(&self, user_id: Uuid) {
        if let Some(fixture) = self.lock().fixtures.get_mut(&user_id) {
            fixture.workshop_credential_id = None;
        }
    }

    fn to_source(credential: &Credential) -> CredentialSource {
        CredentialSource {
            credential_id: credential.id,
            secret: credential.secret.clone(),
            vendor: credential.vendor.clone(),
            tier: None,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), OrchestratorError> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<(), OrchestratorError> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        state.sessions.remove(&session_id);
        state.messages.retain(|_, m| m.session_id != session_id);
        Ok(())
    }

    async fn delete_sessions_for_user_game(&self, user_id: Uuid, game_id: Uuid) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        let dead: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.game_id == game_id)
            .map(|s| s.id)
            .collect();
        for id in dead {
            state.sessions.remove(&id);
            state.messages.retain(|_, m| m.session_id != id);
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        self.lock().sessions.get(&session_id).cloned().ok_or(OrchestratorError::NotFound)
    }

    async fn update_session_vendor_state(&self, session_id: Uuid, state: Option<String>) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        let session = guard.sessions.get_mut(&session_id).ok_or(OrchestratorError::NotFound)?;
        session.ai_session_state = state;
        Ok(())
    }

    async fn clear_session_credential(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        let session = guard.sessions.get_mut(&session_id).ok_or(OrchestratorError::NotFound)?;
        session.credential_id = None;
        session.vendor = None;
        Ok(())
    }

    async fn set_session_org_unverified(&self, session_id: Uuid, org_unverified: bool) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        let session = guard.sessions.get_mut(&session_id).ok_or(OrchestratorError::NotFound)?;
        session.org_unverified = org_unverified;
        Ok(())
    }

    async fn set_session_error(&self, session_id: Uuid, error_message: Option<String>) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        let session = guard.sessions.get_mut(&session_id).ok_or(OrchestratorError::NotFound)?;
        session.error_message = error_message;
        Ok(())
    }

    async fn create_message(&self, mut message: Message) -> Result<Message, OrchestratorError> {
        let mut guard = self.lock();
        let seq = guard.next_seq.entry(message.session_id).or_insert(0);
        message.seq = *seq;
        *seq += 1;
        guard.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update_message(&self, message: &Message) -> Result<(), OrchestratorError> {
        self.lock().messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn delete_message(&self, message_id: Uuid) -> Result<(), OrchestratorError> {
        self.lock().messages.remove(&message_id);
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Message, OrchestratorError> {
        self.lock().messages.get(&message_id).cloned().ok_or(OrchestratorError::NotFound)
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, OrchestratorError> {
        let mut out: Vec<Message> =
            self.lock().messages.values().filter(|m| m.session_id == session_id).cloned().collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    async fn persist_image(&self, message_id: Uuid, bytes: Vec<u8>) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        guard.images.insert(message_id, bytes);
        if let Some(m) = guard.messages.get_mut(&message_id) {
            m.has_image = true;
        }
        Ok(())
    }

    async fn persist_audio(&self, message_id: Uuid, bytes: Vec<u8>) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        guard.audios.insert(message_id, bytes);
        if let Some(m) = guard.messages.get_mut(&message_id) {
            m.has_audio = true;
        }
        Ok(())
    }

    async fn load_image(&self, message_id: Uuid) -> Result<Option<Vec<u8>>, OrchestratorError> {
        Ok(self.lock().images.get(&message_id).cloned())
    }

    async fn load_audio(&self, message_id: Uuid) -> Result<Option<Vec<u8>>, OrchestratorError> {
        Ok(self.lock().audios.get(&message_id).cloned())
    }

    async fn load_game(&self, game_id: Uuid) -> Result<Game, OrchestratorError> {
        self.lock().games.get(&game_id).cloned().ok_or(OrchestratorError::NotFound)
    }

    async fn remove_game_sponsorship(&self, game_id: Uuid) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        let game = guard.games.get_mut(&game_id).ok_or(OrchestratorError::NotFound)?;
        game.sponsor_credential_id = None;
        Ok(())
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User, OrchestratorError> {
        self.lock().users.get(&user_id).cloned().ok_or(OrchestratorError::NotFound)
    }

    async fn get_credential(&self, credential_id: Uuid) -> Result<Credential, OrchestratorError> {
        self.lock().credentials.get(&credential_id).cloned().ok_or(OrchestratorError::NotFound)
    }

    async fn system_settings(&self) -> Result<SystemSettings, OrchestratorError> {
        Ok(self.lock().system_settings.clone())
    }

    async fn update_credential_last_usage(&self, credential_id: Uuid, success: bool) -> Result<(), OrchestratorError> {
        let mut guard = self.lock();
        if let Some(c) = guard.credentials.get_mut(&credential_id) {
            c.last_usage_success = Some(success);
        }
        Ok(())
    }

    async fn credential_resolution_inputs(&self, user_id: Uuid, game_id: Uuid) -> Result<ResolutionInputs, OrchestratorError> {
        let guard = self.lock();
        let user = guard.users.get(&user_id).ok_or(OrchestratorError::NotFound)?;
        let game = guard.games.get(&game_id).ok_or(OrchestratorError::NotFound)?;
        let fixture = guard.fixtures.get(&user_id).cloned().unwrap_or_default();

        let workshop = fixture.workshop_credential_id.and_then(|id| guard.credentials.get(&id)).map(Self::to_source);
        let sponsor = game.sponsor_credential_id.and_then(|id| guard.credentials.get(&id)).map(Self::to_source);
        let institution = fixture.institution_credential_id.and_then(|id| guard.credentials.get(&id)).map(Self::to_source);
        let user_default = user.default_credential_id.and_then(|id| guard.credentials.get(&id)).map(Self::to_source);
        let system = guard.system_settings.fallback_credential_id.and_then(|id| guard.credentials.get(&id)).map(Self::to_source);

        Ok(ResolutionInputs {
            workshop,
            sponsor,
            institution,
            user_default,
            system,
            is_participant: user.is_participant(),
            system_default_tier: guard.system_settings.default_quality_tier.clone(),
        })
    }
}
