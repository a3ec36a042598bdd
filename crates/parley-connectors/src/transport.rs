//! Outbound messaging transport contract and the recording (dry-run) backend.
//!
//! The transport sends one text or audio message to one contact through one
//! connection slot. Retry across slots and tenant suspension are the
//! orchestrator's job; a transport only classifies its own failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::current_unix_timestamp_ms;
use parley_types::{ConnectionSlot, TransportError, TransportErrorKind};
use serde::Serialize;

/// Synthesised or recorded audio handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `DeliveryReceipt` returned by successful sends.
pub struct DeliveryReceipt {
    pub tenant_id: String,
    pub slot_number: u32,
    pub contact_id: String,
    pub provider_message_id: Option<String>,
}

#[async_trait]
/// Trait contract for `MessagingTransport` behavior.
pub trait MessagingTransport: Send + Sync {
    fn transport_name(&self) -> &'static str;

    async fn send_text(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, TransportError>;

    async fn send_audio(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        audio: &OutboundAudio,
    ) -> Result<DeliveryReceipt, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundBody {
    Text { text: String },
    Audio { mime_type: String, bytes: usize },
}

/// One message accepted by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundRecord {
    pub tenant_id: String,
    pub slot_number: u32,
    pub contact_id: String,
    pub body: OutboundBody,
    pub sent_unix_ms: u64,
}

#[derive(Debug, Default)]
struct RecordingState {
    sent: Vec<OutboundRecord>,
    scripted_failures: HashMap<(String, u32), VecDeque<TransportErrorKind>>,
    persistent_failures: HashMap<(String, u32), TransportErrorKind>,
    attempts: u64,
}

/// Dry-run transport that records every accepted message.
///
/// Failures can be scripted per `(tenant, slot)` so callers can exercise
/// retry, fallback and suspension paths without a network.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    state: Mutex<RecordingState>,
    latency: Duration,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every send by `latency` before recording it.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(RecordingState::default()),
            latency,
        }
    }

    /// Fails the next `count` sends through the slot with `kind`.
    pub fn fail_next(
        &self,
        tenant_id: &str,
        slot_number: u32,
        kind: TransportErrorKind,
        count: usize,
    ) {
        let mut state = lock_unpoisoned(&self.state);
        let queue = state
            .scripted_failures
            .entry((tenant_id.to_string(), slot_number))
            .or_default();
        queue.extend(std::iter::repeat(kind).take(count));
    }

    /// Fails every send through the slot with `kind` until cleared.
    pub fn fail_always(&self, tenant_id: &str, slot_number: u32, kind: TransportErrorKind) {
        lock_unpoisoned(&self.state)
            .persistent_failures
            .insert((tenant_id.to_string(), slot_number), kind);
    }

    pub fn clear_failures(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.scripted_failures.clear();
        state.persistent_failures.clear();
    }

    pub fn sent(&self) -> Vec<OutboundRecord> {
        lock_unpoisoned(&self.state).sent.clone()
    }

    /// Number of send calls, including failed ones.
    pub fn attempts(&self) -> u64 {
        lock_unpoisoned(&self.state).attempts
    }

    /// Texts delivered to `contact_id` in send order.
    pub fn texts_for(&self, tenant_id: &str, contact_id: &str) -> Vec<String> {
        lock_unpoisoned(&self.state)
            .sent
            .iter()
            .filter(|record| record.tenant_id == tenant_id && record.contact_id == contact_id)
            .filter_map(|record| match &record.body {
                OutboundBody::Text { text } => Some(text.clone()),
                OutboundBody::Audio { .. } => None,
            })
            .collect()
    }

    async fn record(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        body: OutboundBody,
    ) -> Result<DeliveryReceipt, TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = lock_unpoisoned(&self.state);
        state.attempts = state.attempts.saturating_add(1);
        let slot_key = (slot.tenant_id.clone(), slot.slot_number);
        let scripted = state
            .scripted_failures
            .get_mut(&slot_key)
            .and_then(VecDeque::pop_front);
        if let Some(kind) = scripted.or_else(|| state.persistent_failures.get(&slot_key).copied()) {
            return Err(TransportError::new(
                kind,
                slot.tenant_id.as_str(),
                Some(slot.slot_number),
                "scripted failure",
            ));
        }

        let sequence = state.sent.len() + 1;
        tracing::debug!(
            tenant_id = %slot.tenant_id,
            slot = slot.slot_number,
            contact_id,
            "dry-run delivery recorded"
        );
        state.sent.push(OutboundRecord {
            tenant_id: slot.tenant_id.clone(),
            slot_number: slot.slot_number,
            contact_id: contact_id.to_string(),
            body,
            sent_unix_ms: current_unix_timestamp_ms(),
        });
        Ok(DeliveryReceipt {
            tenant_id: slot.tenant_id.clone(),
            slot_number: slot.slot_number,
            contact_id: contact_id.to_string(),
            provider_message_id: Some(format!("dry-run-{sequence}")),
        })
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    fn transport_name(&self) -> &'static str {
        "dry-run"
    }

    async fn send_text(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.record(
            slot,
            contact_id,
            OutboundBody::Text {
                text: text.to_string(),
            },
        )
        .await
    }

    async fn send_audio(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        audio: &OutboundAudio,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.record(
            slot,
            contact_id,
            OutboundBody::Audio {
                mime_type: audio.mime_type.clone(),
                bytes: audio.bytes.len(),
            },
        )
        .await
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use parley_types::RateLimitStatus;

    use super::*;

    fn slot(tenant_id: &str, slot_number: u32) -> ConnectionSlot {
        ConnectionSlot {
            tenant_id: tenant_id.to_string(),
            slot_number,
            connected: true,
            identity: format!("+55110000{slot_number}"),
            load: 0,
            rate_limit: RateLimitStatus::Normal,
        }
    }

    #[tokio::test]
    async fn functional_recording_transport_records_text_and_audio() {
        let transport = RecordingTransport::new();
        transport
            .send_text(&slot("acme", 0), "+1", "hello")
            .await
            .expect("text");
        transport
            .send_audio(
                &slot("acme", 0),
                "+1",
                &OutboundAudio {
                    bytes: vec![1, 2, 3],
                    mime_type: "audio/ogg".to_string(),
                },
            )
            .await
            .expect("audio");
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(transport.texts_for("acme", "+1"), vec!["hello".to_string()]);
        assert_eq!(
            sent[1].body,
            OutboundBody::Audio {
                mime_type: "audio/ogg".to_string(),
                bytes: 3
            }
        );
    }

    #[tokio::test]
    async fn functional_scripted_failures_are_consumed_in_order() {
        let transport = RecordingTransport::new();
        transport.fail_next("acme", 1, TransportErrorKind::RateLimited, 1);
        let error = transport
            .send_text(&slot("acme", 1), "+1", "a")
            .await
            .expect_err("scripted failure");
        assert_eq!(error.kind, TransportErrorKind::RateLimited);
        assert_eq!(error.slot_number, Some(1));
        transport
            .send_text(&slot("acme", 1), "+1", "b")
            .await
            .expect("second send succeeds");
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn regression_failures_are_scoped_to_tenant_and_slot() {
        let transport = RecordingTransport::new();
        transport.fail_always("acme", 0, TransportErrorKind::Blocked);
        transport
            .send_text(&slot("globex", 0), "+1", "other tenant")
            .await
            .expect("other tenant unaffected");
        transport
            .send_text(&slot("acme", 1), "+1", "other slot")
            .await
            .expect("other slot unaffected");
        assert!(transport
            .send_text(&slot("acme", 0), "+1", "blocked")
            .await
            .is_err());
    }
}
