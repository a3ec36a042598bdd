use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::ContactKey;

/// Text and/or audio carried by one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio_ref: Option<String>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            audio_ref: None,
        }
    }

    pub fn audio(audio_ref: impl Into<String>) -> Self {
        Self {
            text: None,
            audio_ref: Some(audio_ref.into()),
        }
    }

    /// Trimmed text, or an empty string when the payload carries none.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or_default()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_ref
            .as_deref()
            .is_some_and(|audio_ref| !audio_ref.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.text_or_empty().is_empty() && !self.has_audio()
    }
}

/// One message waiting in a contact's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: u64,
    pub key: ContactKey,
    pub payload: MessagePayload,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

/// Inbound event delivered by the messaging channel.
///
/// `tenant_id` may be absent; the engine then resolves it through the
/// candidate directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    pub contact_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio_ref: Option<String>,
}

impl InboundMessageEvent {
    pub fn text(
        tenant_id: Option<&str>,
        contact_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            tenant_id: tenant_id.map(str::to_string),
            text: Some(text.into()),
            audio_ref: None,
        }
    }

    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            text: self.text.clone(),
            audio_ref: self.audio_ref.clone(),
        }
    }
}
