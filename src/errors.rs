//! Typed error hierarchy for leadboard.
//!
//! Three top-level enums cover the three subsystems:
//! - `CrmError`: stage directory, lead store and stage-move failures
//! - `WebhookError`: payment webhook verification and recording failures
//! - `BoardError`: client-side board controller failures

use std::time::Duration;

use thiserror::Error;

/// Errors from the CRM service layer (stages, leads, stage moves).
///
/// Cross-tenant references are reported with the `*NotFound` variants so
/// that a caller cannot discover records owned by another tenant.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Tenant {id} not found")]
    TenantNotFound { id: String },

    #[error("Lead {id} not found")]
    LeadNotFound { id: String },

    #[error("Stage {id} not found")]
    StageNotFound { id: String },

    #[error("Tag {id} not found")]
    TagNotFound { id: String },

    #[error("Stage {id} still has {count} lead(s); move them before deleting it")]
    StageHasLeads { id: String, count: i64 },

    #[error("Tenant {tenant_id} has no active pipeline stage to receive new leads")]
    NoIntakeStage { tenant_id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    /// True for the not-found class of errors (including scoping rejections).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TenantNotFound { .. }
                | Self::LeadNotFound { .. }
                | Self::StageNotFound { .. }
                | Self::TagNotFound { .. }
        )
    }
}

/// Errors from the payment webhook reconciler.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook secret is not configured")]
    MissingSecret,

    #[error("Webhook signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to record transaction: {0}")]
    Recording(#[source] anyhow::Error),
}

/// Errors surfaced by the board controller to the UI layer.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Lead {id} is not on the board")]
    UnknownLead { id: String },

    #[error("Stage {id} is not on the board")]
    UnknownStage { id: String },

    #[error("Stage move rejected: {0}")]
    CommandFailed(String),

    #[error("Stage move timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Board transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crm_error_lead_not_found_carries_id() {
        let err = CrmError::LeadNotFound {
            id: "lead-42".into(),
        };
        match &err {
            CrmError::LeadNotFound { id } => assert_eq!(id, "lead-42"),
            _ => panic!("Expected LeadNotFound"),
        }
        assert!(err.to_string().contains("lead-42"));
    }

    #[test]
    fn crm_error_not_found_class() {
        assert!(CrmError::StageNotFound { id: "s".into() }.is_not_found());
        assert!(CrmError::TenantNotFound { id: "t".into() }.is_not_found());
        assert!(!CrmError::Validation("missing id".into()).is_not_found());
        assert!(!CrmError::LockPoisoned.is_not_found());
    }

    #[test]
    fn stage_has_leads_mentions_count() {
        let err = CrmError::StageHasLeads {
            id: "s1".into(),
            count: 3,
        };
        assert!(err.to_string().contains("3 lead(s)"));
    }

    #[test]
    fn crm_error_converts_from_anyhow() {
        let err: CrmError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, CrmError::Other(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn board_error_timed_out_reports_duration() {
        let err = BoardError::TimedOut(Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CrmError::LockPoisoned);
        assert_std_error(&WebhookError::MissingSecret);
        assert_std_error(&BoardError::UnknownLead { id: "x".into() });
    }
}
