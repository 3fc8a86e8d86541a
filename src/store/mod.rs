//! Repository Interface (C7): the narrow storage contract consumed by the
//! orchestrator. Access checks (who may load what) are the repository's
//! responsibility; the orchestrator trusts the answer.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::credential::ResolutionInputs;
use crate::domain::{Credential, Game, Message, Session, SystemSettings, User};
use crate::error::OrchestratorError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), OrchestratorError>;
    async fn update_session(&self, session: &Session) -> Result<(), OrchestratorError>;
    async fn delete_session(&self, session_id: Uuid) -> Result<(), OrchestratorError>;
    async fn delete_sessions_for_user_game(&self, user_id: Uuid, game_id: Uuid) -> Result<(), OrchestratorError>;
    async fn get_session(&self, session_id: Uuid) -> Result<Session, OrchestratorError>;
    async fn update_session_vendor_state(&self, session_id: Uuid, state: Option<String>) -> Result<(), OrchestratorError>;
    async fn clear_session_credential(&self, session_id: Uuid) -> Result<(), OrchestratorError>;
    async fn set_session_org_unverified(&self, session_id: Uuid, org_unverified: bool) -> Result<(), OrchestratorError>;
    async fn set_session_error(&self, session_id: Uuid, error_message: Option<String>) -> Result<(), OrchestratorError>;

    /// Creates a message and assigns its dense, monotonic `seq` within the
    /// session, returning the persisted row.
    async fn create_message(&self, message: Message) -> Result<Message, OrchestratorError>;
    async fn update_message(&self, message: &Message) -> Result<(), OrchestratorError>;
    async fn delete_message(&self, message_id: Uuid) -> Result<(), OrchestratorError>;
    async fn get_message(&self, message_id: Uuid) -> Result<Message, OrchestratorError>;
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, OrchestratorError>;

    async fn persist_image(&self, message_id: Uuid, bytes: Vec<u8>) -> Result<(), OrchestratorError>;
    async fn persist_audio(&self, message_id: Uuid, bytes: Vec<u8>) -> Result<(), OrchestratorError>;
    async fn load_image(&self, message_id: Uuid) -> Result<Option<Vec<u8>>, OrchestratorError>;
    async fn load_audio(&self, message_id: Uuid) -> Result<Option<Vec<u8>>, OrchestratorError>;

    async fn load_game(&self, game_id: Uuid) -> Result<Game, OrchestratorError>;
    async fn remove_game_sponsorship(&self, game_id: Uuid) -> Result<(), OrchestratorError>;
    async fn load_user(&self, user_id: Uuid) -> Result<User, OrchestratorError>;
    async fn get_credential(&self, credential_id: Uuid) -> Result<Credential, OrchestratorError>;
    async fn system_settings(&self) -> Result<SystemSettings, OrchestratorError>;
    async fn update_credential_last_usage(&self, credential_id: Uuid, success: bool) -> Result<(), OrchestratorError>;

    /// Assembles the five-priority candidate inputs for (user, game),
    /// performing whatever access checks the credential-share surface
    /// requires.
    async fn credential_resolution_inputs(&self, user_id: Uuid, game_id: Uuid) -> Result<ResolutionInputs, OrchestratorError>;
}
