//! Core domain entities shared by every component.

pub mod models;

pub use models::{
    Credential, CredentialShare, Game, Message, MessageType, Session, ShareAudience, StatusField,
    SystemSettings, TokenUsage, User, UserRole,
};
