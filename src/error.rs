//! Closed error taxonomy (C6) shared by every component.
//!
//! Every fallible orchestrator entry point returns this enum rather than a
//! string; the HTTP layer is the only place that projects it into the
//! `{statusCode, code, message}` envelope.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no usable credential for this user and game")]
    NoApiKey,

    #[error("credential {credential_id} rejected as an invalid api key")]
    InvalidApiKey { credential_id: Uuid },

    #[error("credential {credential_id} has billing not active")]
    BillingNotActive { credential_id: Uuid },

    #[error("credential {credential_id} has insufficient quota")]
    InsufficientQuota { credential_id: Uuid },

    #[error("vendor rate limit exceeded")]
    RateLimitExceeded,

    #[error("organization verification required")]
    OrgVerificationRequired,

    #[error("content filtered by vendor policy")]
    ContentFiltered,

    #[error("ai error: {0}")]
    AiError(String),

    #[error("unknown model platform: {0}")]
    InvalidPlatform(String),

    #[error("the game's sponsored api key stopped working")]
    SponsoredApiKeyNotWorking,

    #[error("not found")]
    NotFound,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal server error")]
    ServerError(#[source] anyhow::Error),
}

impl OrchestratorError {
    /// The closed `code` vocabulary surfaced in the HTTP error envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoApiKey => "no_api_key",
            Self::InvalidApiKey { .. } => "invalid_api_key",
            Self::BillingNotActive { .. } => "billing_not_active",
            Self::InsufficientQuota { .. } => "insufficient_quota",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::OrgVerificationRequired => "org_verification_required",
            Self::ContentFiltered => "content_filtered",
            Self::AiError(_) => "ai_error",
            Self::InvalidPlatform(_) => "invalid_platform",
            Self::SponsoredApiKeyNotWorking => "sponsored_api_key_not_working",
            Self::NotFound => "not_found",
            Self::Validation(_) => "validation",
            Self::ServerError(_) => "server_error",
        }
    }

    /// HTTP status code for the envelope.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Validation(_) => 400,
            Self::NoApiKey
            | Self::InvalidApiKey { .. }
            | Self::BillingNotActive { .. }
            | Self::InsufficientQuota { .. }
            | Self::SponsoredApiKeyNotWorking => 402,
            Self::RateLimitExceeded => 429,
            Self::OrgVerificationRequired | Self::ContentFiltered | Self::AiError(_) => 422,
            Self::InvalidPlatform(_) => 400,
            Self::ServerError(_) => 500,
        }
    }

    /// "Credential-fatal": invalidates the credential currently bound to
    /// the session. Phase 1 falls back to the next candidate; Phase 3
    /// clears the session's credential.
    #[must_use]
    pub const fn is_credential_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidApiKey { .. } | Self::BillingNotActive { .. } | Self::InsufficientQuota { .. }
        )
    }

    /// The credential id a credential-fatal error is attributable to, if any.
    #[must_use]
    pub const fn fatal_credential_id(&self) -> Option<Uuid> {
        match self {
            Self::InvalidApiKey { credential_id }
            | Self::BillingNotActive { credential_id }
            | Self::InsufficientQuota { credential_id } => Some(*credential_id),
            _ => None,
        }
    }
}

/// Map a vendor's raw error text to the closed taxonomy. Matching is
/// case-insensitive substring, checked in the order below — earlier matches
/// win when a message happens to contain more than one trigger phrase.
#[must_use]
pub fn classify_vendor_error(credential_id: Uuid, raw: &str) -> OrchestratorError {
    let lower = raw.to_lowercase();
    if lower.contains("invalid_api_key") {
        OrchestratorError::InvalidApiKey { credential_id }
    } else if lower.contains("billing_not_active") {
        OrchestratorError::BillingNotActive { credential_id }
    } else if lower.contains("organization_verification_required") {
        OrchestratorError::OrgVerificationRequired
    } else if lower.contains("rate_limit") {
        OrchestratorError::RateLimitExceeded
    } else if lower.contains("insufficient_quota") || lower.contains("quota") {
        OrchestratorError::InsufficientQuota { credential_id }
    } else if lower.contains("content_policy") || lower.contains("content_filter") {
        OrchestratorError::ContentFiltered
    } else {
        OrchestratorError::AiError(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn classifies_invalid_api_key() {
        let id = cred();
        let err = classify_vendor_error(id, "Error: invalid_api_key supplied");
        assert_eq!(err.code(), "invalid_api_key");
        assert!(err.is_credential_fatal());
        assert_eq!(err.fatal_credential_id(), Some(id));
    }

    #[test]
    fn classifies_quota_case_insensitively() {
        let err = classify_vendor_error(cred(), "QUOTA exceeded for this account");
        assert_eq!(err.code(), "insufficient_quota");
    }

    #[test]
    fn classifies_rate_limit_as_non_fatal() {
        let err = classify_vendor_error(cred(), "rate_limit_exceeded, slow down");
        assert_eq!(err.code(), "rate_limit_exceeded");
        assert!(!err.is_credential_fatal());
    }

    #[test]
    fn falls_back_to_ai_error() {
        let err = classify_vendor_error(cred(), "the model timed out unexpectedly");
        assert_eq!(err.code(), "ai_error");
        assert!(!err.is_credential_fatal());
    }

    #[test]
    fn org_verification_is_not_credential_fatal() {
        let err = classify_vendor_error(cred(), "organization_verification_required: please verify");
        assert_eq!(err.code(), "org_verification_required");
        assert!(!err.is_credential_fatal());
    }
}
