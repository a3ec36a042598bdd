use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::InterviewStatus;

/// Error returned when an interview status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid interview status transition: {from} -> {to}")]
    Invalid { from: String, to: String },
}

/// A message arrived for a contact whose session cannot accept it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("no live session for contact")]
    NoSession,
    #[error("session is already terminal ({status})")]
    Terminal { status: InterviewStatus },
    #[error("response targets question {received} but session awaits question {expected}")]
    QuestionMismatch { expected: usize, received: usize },
    #[error("interview definition has no questions")]
    EmptyInterview,
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TransportErrorKind` values.
pub enum TransportErrorKind {
    /// Provider or network is temporarily unavailable.
    Unavailable,
    /// Provider asked the slot to slow down.
    RateLimited,
    /// Provider refuses to deliver through this slot.
    Blocked,
    /// Tenant has no usable credentials for the gateway.
    MissingCredentials,
    /// Provider rejected the request itself.
    Rejected,
    /// No connected slot exists for the tenant.
    NoActiveSlot,
    /// Sends for the tenant are suspended until configuration is fixed.
    TenantSuspended,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "transport_unavailable",
            Self::RateLimited => "transport_rate_limited",
            Self::Blocked => "transport_blocked",
            Self::MissingCredentials => "transport_missing_credentials",
            Self::Rejected => "transport_rejected",
            Self::NoActiveSlot => "transport_no_active_slot",
            Self::TenantSuspended => "transport_tenant_suspended",
        }
    }
}

/// Outbound send failure reported by the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason} tenant={tenant_id} slot={slot_number:?} detail={detail}", reason = .kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub tenant_id: String,
    pub slot_number: Option<u32>,
    pub detail: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        tenant_id: impl Into<String>,
        slot_number: Option<u32>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            slot_number,
            detail: detail.into(),
        }
    }

    /// Returns true when another attempt (or another slot) may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Unavailable
                | TransportErrorKind::RateLimited
                | TransportErrorKind::Blocked
        )
    }

    /// Returns true when the failure is a tenant configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::MissingCredentials | TransportErrorKind::TenantSuspended
        )
    }
}

/// Error taxonomy surfaced at the orchestration boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("transcription error: {0}")]
    Transcription(String),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("no candidate or active interview for contact '{contact_id}' in tenant '{tenant_id}'")]
    ContactNotFound {
        tenant_id: String,
        contact_id: String,
    },
    #[error("configuration error for tenant '{tenant_id}': {reason}")]
    Configuration { tenant_id: String, reason: String },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("directory error: {0}")]
    Directory(String),
}

impl OrchestratorError {
    /// Stable snake_case code for logs and snapshots.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Transport(error) => error.kind.as_str(),
            Self::Transcription(_) => "transcription_failed",
            Self::State(_) => "state_error",
            Self::ContactNotFound { .. } => "contact_not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Persistence(_) => "persistence_failed",
            Self::Directory(_) => "directory_lookup_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_transport_error_retryable_classification() {
        let unavailable =
            TransportError::new(TransportErrorKind::Unavailable, "acme", Some(1), "timeout");
        let missing =
            TransportError::new(TransportErrorKind::MissingCredentials, "acme", None, "token");
        assert!(unavailable.retryable());
        assert!(!unavailable.is_configuration());
        assert!(!missing.retryable());
        assert!(missing.is_configuration());
    }

    #[test]
    fn unit_transport_error_display_includes_reason_code() {
        let error = TransportError::new(TransportErrorKind::RateLimited, "acme", Some(2), "429");
        let rendered = error.to_string();
        assert!(rendered.contains("transport_rate_limited"));
        assert!(rendered.contains("tenant=acme"));
    }

    #[test]
    fn unit_orchestrator_error_reason_codes_are_stable() {
        let error = OrchestratorError::from(StateError::NoSession);
        assert_eq!(error.reason_code(), "state_error");
        let error = OrchestratorError::ContactNotFound {
            tenant_id: "acme".to_string(),
            contact_id: "+100".to_string(),
        };
        assert_eq!(error.reason_code(), "contact_not_found");
    }
}
