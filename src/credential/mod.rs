//! Credential Resolver (C2): produces an ordered, deduplicated list of
//! usable credentials for a (user, game) pair from the five-priority
//! chain.

pub mod resolver;

pub use resolver::{CredentialCandidate, CredentialSource, Priority, ResolutionInputs, resolve_full, resolve_top};
