//! Entities and value types persisted through the repository interface.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single named field in a game's status schema, e.g. `"health"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusField {
    pub name: String,
}

/// Image style tag that disables image generation entirely.
pub const NO_IMAGE_STYLE: &str = "none";

/// Identity of a player. The institution/workshop administrative surface that
/// assigns `role` lives outside this crate; we only consume the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// BCP-47-ish language code, e.g. `"en"`. Empty means unset.
    pub language: String,
    pub default_credential_id: Option<Uuid>,
    pub role: UserRole,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn is_participant(&self) -> bool {
        matches!(self.role, UserRole::WorkshopGuest { .. })
    }

    #[must_use]
    pub fn wants_translation(&self) -> bool {
        !self.language.is_empty() && !self.language.eq_ignore_ascii_case("en")
    }
}

/// How a user is bound into the (out-of-scope) institution/workshop surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UserRole {
    None,
    Institution { institution_id: Uuid },
    /// An anonymous workshop participant. Restricted to the workshop
    /// credential only (resolver priority 1).
    WorkshopGuest { workshop_id: Uuid },
    /// A non-guest member attending a workshop, still eligible for
    /// institution-level credentials.
    WorkshopMember { workshop_id: Uuid, institution_id: Option<Uuid> },
}

/// A template definition. Immutable to the orchestrator once loaded for a
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub scenario: String,
    pub status_fields: Vec<StatusField>,
    pub image_style: String,
    pub theme: Option<serde_json::Value>,
    pub sponsor_credential_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    #[must_use]
    pub fn images_disabled(&self) -> bool {
        self.image_style.eq_ignore_ascii_case(NO_IMAGE_STYLE)
    }
}

/// An opaque vendor secret. The secret is never included in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub vendor: String,
    pub secret: String,
    pub display_name: String,
    pub last_usage_success: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("owner_user_id", &self.owner_user_id)
            .field("vendor", &self.vendor)
            .field("secret", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("last_usage_success", &self.last_usage_success)
            .finish()
    }
}

/// Binds a credential to an audience that may use it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialShare {
    pub id: Uuid,
    pub credential_id: Uuid,
    pub audience: ShareAudience,
    pub quality_tier: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShareAudience {
    /// The credential's own owner. One per credential, created alongside it.
    SelfOwner,
    Institution(Uuid),
    User(Uuid),
    /// Scoped to guests of one specific game (e.g. a workshop credential).
    GameGuest(Uuid),
}

/// Process-singleton settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub fallback_credential_id: Option<Uuid>,
    pub default_quality_tier: String,
}

/// A game session bound to one user, snapshotting the game's fields at
/// creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub game_id: Uuid,
    pub name: String,
    pub description: String,
    pub image_style: String,
    pub status_fields: Vec<StatusField>,
    pub theme: Option<serde_json::Value>,
    pub credential_id: Option<Uuid>,
    pub vendor: Option<String>,
    pub quality_tier: Option<String>,
    /// Opaque blob owned by the model-platform adapter; the orchestrator
    /// never parses it.
    pub ai_session_state: Option<String>,
    pub org_unverified: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn images_disabled(&self) -> bool {
        self.image_style.eq_ignore_ascii_case(NO_IMAGE_STYLE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    System,
    Player,
    Game,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Player => "player",
            Self::Game => "game",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One turn's persisted row. `seq` is assigned by the repository and is
/// dense and monotonic within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: i64,
    pub message_type: MessageType,
    pub body: String,
    pub status_fields: serde_json::Value,
    pub plot: Option<String>,
    pub image_prompt: Option<String>,
    pub has_image: bool,
    pub has_audio: bool,
    pub streaming: bool,
    pub token_usage: TokenUsage,
    pub prompt_status_update: Option<String>,
    pub prompt_expand_story: Option<String>,
    pub prompt_response_schema: Option<String>,
    pub prompt_image_generation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Additive token usage. Associative and commutative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
    pub total: i64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input: i64, output: i64) -> Self {
        Self { input, output, total: input + output }
    }
}

impl std::ops::Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            total: self.total + rhs.total,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_is_associative() {
        let a = TokenUsage::new(10, 5);
        let b = TokenUsage::new(3, 7);
        let c = TokenUsage::new(1, 1);
        let left = (a + b) + c;
        let right = a + (b + c);
        assert_eq!(left, right);
        assert_eq!(left.total, left.input + left.output);
    }

    #[test]
    fn participant_role_is_detected() {
        let user = User {
            id: Uuid::new_v4(),
            language: "en".into(),
            default_credential_id: None,
            role: UserRole::WorkshopGuest { workshop_id: Uuid::new_v4() },
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(user.is_participant());
    }

    #[test]
    fn images_disabled_is_case_insensitive() {
        let game = Game {
            id: Uuid::new_v4(),
            name: "t".into(),
            description: String::new(),
            scenario: String::new(),
            status_fields: vec![],
            image_style: "NONE".into(),
            theme: None,
            sponsor_credential_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(game.images_disabled());
    }
}
