//! Priority chain, consulted in order: workshop, sponsored-game,
//! institution free-use, user default, system free-use. Participants
//! (anonymous workshop guests) are restricted to the workshop credential
//! alone.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::OrchestratorError;

/// Up to this many deduplicated candidates are returned.
const MAX_CANDIDATES: usize = 3;
const HARDCODED_BALANCED_TIER: &str = "balanced";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Workshop,
    SponsoredGame,
    InstitutionFreeUse,
    UserDefault,
    SystemFreeUse,
}

/// One potential credential at a given priority level, as assembled by the
/// repository from the (out-of-scope) institution/workshop surface.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    pub credential_id: Uuid,
    pub secret: String,
    pub vendor: String,
    /// Empty or absent means "fall through to the system default tier".
    pub tier: Option<String>,
}

/// Everything the resolver needs for one (user, game) pair, assembled by
/// the repository.
#[derive(Debug, Clone, Default)]
pub struct ResolutionInputs {
    pub workshop: Option<CredentialSource>,
    pub sponsor: Option<CredentialSource>,
    pub institution: Option<CredentialSource>,
    pub user_default: Option<CredentialSource>,
    pub system: Option<CredentialSource>,
    pub is_participant: bool,
    pub system_default_tier: String,
}

/// A resolved, tiered, deduplicated candidate ready to apply to a session.
#[derive(Debug, Clone)]
pub struct CredentialCandidate {
    pub credential_id: Uuid,
    pub secret: String,
    pub vendor: String,
    pub tier: String,
    pub priority: Priority,
}

fn resolve_tier(source_tier: Option<&str>, system_default_tier: &str) -> String {
    source_tier
        .filter(|t| !t.is_empty())
        .or_else(|| Some(system_default_tier).filter(|t| !t.is_empty()))
        .map_or_else(|| HARDCODED_BALANCED_TIER.to_string(), ToString::to_string)
}

/// Ordered, deduplicated, up to `MAX_CANDIDATES`. Priorities are
/// monotonically non-decreasing in the output order; a credential
/// reachable via two levels appears once, at its highest (earliest) level.
#[must_use]
pub fn resolve_candidates(inputs: &ResolutionInputs) -> Vec<CredentialCandidate> {
    let mut levels: Vec<(Priority, &Option<CredentialSource>)> = vec![(Priority::Workshop, &inputs.workshop)];
    if !inputs.is_participant {
        levels.push((Priority::SponsoredGame, &inputs.sponsor));
        levels.push((Priority::InstitutionFreeUse, &inputs.institution));
        levels.push((Priority::UserDefault, &inputs.user_default));
        levels.push((Priority::SystemFreeUse, &inputs.system));
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(MAX_CANDIDATES);
    for (priority, source) in levels {
        if candidates.len() >= MAX_CANDIDATES {
            break;
        }
        let Some(source) = source else { continue };
        if !seen.insert(source.credential_id) {
            continue;
        }
        candidates.push(CredentialCandidate {
            credential_id: source.credential_id,
            secret: source.secret.clone(),
            vendor: source.vendor.clone(),
            tier: resolve_tier(source.tier.as_deref(), &inputs.system_default_tier),
            priority,
        });
    }
    candidates
}

/// Top-only entry point, used for availability probes.
pub fn resolve_top(inputs: &ResolutionInputs) -> Result<CredentialCandidate, OrchestratorError> {
    resolve_candidates(inputs).into_iter().next().ok_or(OrchestratorError::NoApiKey)
}

/// Full-list entry point, used by the orchestrator for fallback retry.
pub fn resolve_full(inputs: &ResolutionInputs) -> Result<Vec<CredentialCandidate>, OrchestratorError> {
    let candidates = resolve_candidates(inputs);
    if candidates.is_empty() { Err(OrchestratorError::NoApiKey) } else { Ok(candidates) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: Uuid) -> CredentialSource {
        CredentialSource { credential_id: id, secret: "s".into(), vendor: "mock".into(), tier: None }
    }

    #[test]
    fn no_candidates_is_no_api_key() {
        let inputs = ResolutionInputs { system_default_tier: "balanced".into(), ..Default::default() };
        assert!(matches!(resolve_top(&inputs), Err(OrchestratorError::NoApiKey)));
        assert!(matches!(resolve_full(&inputs), Err(OrchestratorError::NoApiKey)));
    }

    #[test]
    fn dedups_by_credential_id_keeping_highest_priority() {
        let shared = Uuid::new_v4();
        let inputs = ResolutionInputs {
            workshop: Some(source(shared)),
            sponsor: Some(source(shared)),
            system_default_tier: "balanced".into(),
            ..Default::default()
        };
        let candidates = resolve_candidates(&inputs);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].priority, Priority::Workshop);
    }

    #[test]
    fn caps_at_three_and_orders_non_decreasing() {
        let inputs = ResolutionInputs {
            workshop: Some(source(Uuid::new_v4())),
            sponsor: Some(source(Uuid::new_v4())),
            institution: Some(source(Uuid::new_v4())),
            user_default: Some(source(Uuid::new_v4())),
            system: Some(source(Uuid::new_v4())),
            system_default_tier: "balanced".into(),
            ..Default::default()
        };
        let candidates = resolve_candidates(&inputs);
        assert_eq!(candidates.len(), 3);
        for pair in candidates.windows(2) {
            assert!(pair[0].priority <= pair[1].priority);
        }
    }

    #[test]
    fn participant_is_restricted_to_workshop_only() {
        let inputs = ResolutionInputs {
            workshop: Some(source(Uuid::new_v4())),
            institution: Some(source(Uuid::new_v4())),
            is_participant: true,
            system_default_tier: "balanced".into(),
            ..Default::default()
        };
        let candidates = resolve_candidates(&inputs);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].priority, Priority::Workshop);
    }

    #[test]
    fn participant_without_workshop_credential_has_no_candidates() {
        let inputs = ResolutionInputs {
            institution: Some(source(Uuid::new_v4())),
            is_participant: true,
            system_default_tier: "balanced".into(),
            ..Default::default()
        };
        assert!(resolve_candidates(&inputs).is_empty());
    }

    #[test]
    fn empty_tier_falls_back_to_system_default_then_hardcoded() {
        let mut with_empty_tier = source(Uuid::new_v4());
        with_empty_tier.tier = Some(String::new());
        let inputs =
            ResolutionInputs { workshop: Some(with_empty_tier), system_default_tier: String::new(), ..Default::default() };
        let candidates = resolve_candidates(&inputs);
        assert_eq!(candidates[0].tier, HARDCODED_BALANCED_TIER);
    }

    proptest::proptest! {
        /// For any combination of present/absent sources at each level, the
        /// output stays non-decreasing in priority and never exceeds
        /// `MAX_CANDIDATES`.
        #[test]
        fn candidate_order_is_monotonic_non_decreasing(
            has_workshop: bool,
            has_sponsor: bool,
            has_institution: bool,
            has_user_default: bool,
            has_system: bool,
            is_participant: bool,
        ) {
            let inputs = ResolutionInputs {
                workshop: has_workshop.then(|| source(Uuid::new_v4())),
                sponsor: has_sponsor.then(|| source(Uuid::new_v4())),
                institution: has_institution.then(|| source(Uuid::new_v4())),
                user_default: has_user_default.then(|| source(Uuid::new_v4())),
                system: has_system.then(|| source(Uuid::new_v4())),
                is_participant,
                system_default_tier: "balanced".into(),
            };
            let candidates = resolve_candidates(&inputs);
            proptest::prop_assert!(candidates.len() <= MAX_CANDIDATES);
            for pair in candidates.windows(2) {
                proptest::prop_assert!(pair[0].priority <= pair[1].priority);
            }
            if is_participant {
                proptest::prop_assert!(candidates.iter().all(|c| c.priority == Priority::Workshop));
            }
        }
    }
}
