//! Channel-side inbound envelope parsing for NDJSON event logs.

use parley_types::InboundMessageEvent;
use serde::Deserialize;
use thiserror::Error;

pub const ENVELOPE_REASON_INVALID_JSON: &str = "invalid_json";
pub const ENVELOPE_REASON_MISSING_CONTACT: &str = "missing_contact";
pub const ENVELOPE_REASON_EMPTY_CONTENT: &str = "empty_content";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Enumerates supported `InboundEnvelopeError` values.
pub enum InboundEnvelopeError {
    #[error("inbound line is not a valid envelope: {0}")]
    InvalidJson(String),
    #[error("inbound envelope has no contact_id")]
    MissingContact,
    #[error("inbound envelope for '{contact_id}' carries neither text nor audio")]
    EmptyContent { contact_id: String },
}

impl InboundEnvelopeError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => ENVELOPE_REASON_INVALID_JSON,
            Self::MissingContact => ENVELOPE_REASON_MISSING_CONTACT,
            Self::EmptyContent { .. } => ENVELOPE_REASON_EMPTY_CONTENT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio_ref: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses one NDJSON line `{contact_id, tenant_id?, text?, audio_ref?}`.
///
/// Identifiers are trimmed and blank optional fields dropped. Message text is
/// kept verbatim so classification sees what the contact typed.
pub fn parse_inbound_envelope(line: &str) -> Result<InboundMessageEvent, InboundEnvelopeError> {
    let envelope = serde_json::from_str::<InboundEnvelope>(line.trim())
        .map_err(|error| InboundEnvelopeError::InvalidJson(error.to_string()))?;
    let contact_id = non_blank(envelope.contact_id).ok_or(InboundEnvelopeError::MissingContact)?;
    let text = envelope.text.filter(|text| !text.trim().is_empty());
    let audio_ref = non_blank(envelope.audio_ref);
    if text.is_none() && audio_ref.is_none() {
        return Err(InboundEnvelopeError::EmptyContent { contact_id });
    }
    Ok(InboundMessageEvent {
        contact_id,
        tenant_id: non_blank(envelope.tenant_id),
        text,
        audio_ref,
    })
}
