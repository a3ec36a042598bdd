//! Outbound router: slot selection, cross-slot retry, tenant suspension and
//! adaptive pacing feedback.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use parley_connectors::{DeliveryReceipt, MessagingTransport, OutboundAudio};
use parley_types::{
    ConnectionSlot, ContactKey, RateLimitStatus, TransportError, TransportErrorKind,
};

use crate::config::PacingConfig;
use crate::locks::lock_unpoisoned;
use crate::slot_registry::ConnectionSlotRegistry;

const OUTBOUND_REASON_SLOT_RETRY: &str = "transport_slot_retry";
const OUTBOUND_REASON_TENANT_SUSPENDED: &str = "tenant_suspended_missing_credentials";

#[derive(Debug, Clone, Copy)]
enum OutboundContent<'a> {
    Text(&'a str),
    Audio(&'a OutboundAudio),
}

#[derive(Debug, Default)]
struct RouterState {
    suspended: HashSet<String>,
    pacing_multipliers: HashMap<String, u32>,
    affinity: HashMap<ContactKey, u32>,
}

/// Sends through a tenant's slots, never through another tenant's.
pub struct OutboundRouter {
    slots: Arc<ConnectionSlotRegistry>,
    transport: Arc<dyn MessagingTransport>,
    pacing: PacingConfig,
    state: Mutex<RouterState>,
}

impl OutboundRouter {
    pub fn new(
        slots: Arc<ConnectionSlotRegistry>,
        transport: Arc<dyn MessagingTransport>,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            slots,
            transport,
            pacing,
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.transport_name()
    }

    pub async fn send_text(
        &self,
        tenant_id: &str,
        contact_id: &str,
        text: &str,
        preferred_slot: Option<u32>,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.send(
            tenant_id,
            contact_id,
            OutboundContent::Text(text),
            preferred_slot,
        )
        .await
    }

    pub async fn send_audio(
        &self,
        tenant_id: &str,
        contact_id: &str,
        audio: &OutboundAudio,
        preferred_slot: Option<u32>,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.send(
            tenant_id,
            contact_id,
            OutboundContent::Audio(audio),
            preferred_slot,
        )
        .await
    }

    pub fn is_suspended(&self, tenant_id: &str) -> bool {
        lock_unpoisoned(&self.state).suspended.contains(tenant_id)
    }

    pub fn suspend_tenant(&self, tenant_id: &str) {
        if lock_unpoisoned(&self.state)
            .suspended
            .insert(tenant_id.to_string())
        {
            tracing::warn!(
                tenant_id,
                reason_code = OUTBOUND_REASON_TENANT_SUSPENDED,
                "outbound sends suspended for tenant"
            );
        }
    }

    pub fn resume_tenant(&self, tenant_id: &str) -> bool {
        let resumed = lock_unpoisoned(&self.state).suspended.remove(tenant_id);
        if resumed {
            tracing::info!(tenant_id, "outbound sends resumed for tenant");
        }
        resumed
    }

    /// Current adaptive backoff multiplier for the tenant (1 when disabled).
    pub fn pacing_multiplier(&self, tenant_id: &str) -> u32 {
        if !self.pacing.adaptive_pacing {
            return 1;
        }
        lock_unpoisoned(&self.state)
            .pacing_multipliers
            .get(tenant_id)
            .copied()
            .unwrap_or(1)
    }

    /// Slot the contact was last reached through, if any.
    pub fn affinity(&self, key: &ContactKey) -> Option<u32> {
        lock_unpoisoned(&self.state).affinity.get(key).copied()
    }

    /// Drops the contact's slot affinity once nothing more will be sent to it.
    pub fn forget(&self, key: &ContactKey) -> bool {
        lock_unpoisoned(&self.state).affinity.remove(key).is_some()
    }

    async fn send(
        &self,
        tenant_id: &str,
        contact_id: &str,
        content: OutboundContent<'_>,
        preferred_slot: Option<u32>,
    ) -> Result<DeliveryReceipt, TransportError> {
        if self.is_suspended(tenant_id) {
            return Err(TransportError::new(
                TransportErrorKind::TenantSuspended,
                tenant_id,
                None,
                "sends suspended until tenant configuration is resolved",
            ));
        }
        let key = ContactKey::new(tenant_id, contact_id);
        let preferred = preferred_slot.or_else(|| self.affinity(&key));
        let candidates = self.candidate_slots(tenant_id, preferred);
        if candidates.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::NoActiveSlot,
                tenant_id,
                None,
                "tenant has no connected sendable slot",
            ));
        }

        let mut last_error = None;
        for (attempt, slot) in candidates.iter().enumerate() {
            let result = match content {
                OutboundContent::Text(text) => {
                    self.transport.send_text(slot, contact_id, text).await
                }
                OutboundContent::Audio(audio) => {
                    self.transport.send_audio(slot, contact_id, audio).await
                }
            };
            match result {
                Ok(receipt) => {
                    self.record_success(&key, slot);
                    return Ok(receipt);
                }
                Err(error) => {
                    self.record_failure(slot, &error);
                    if error.kind == TransportErrorKind::MissingCredentials {
                        self.suspend_tenant(tenant_id);
                        return Err(error);
                    }
                    if attempt + 1 < candidates.len() {
                        tracing::warn!(
                            tenant_id,
                            contact_id,
                            slot = slot.slot_number,
                            reason_code = OUTBOUND_REASON_SLOT_RETRY,
                            error = %error,
                            "outbound send failed; retrying on another slot"
                        );
                    }
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            TransportError::new(
                TransportErrorKind::NoActiveSlot,
                tenant_id,
                None,
                "no slot attempted",
            )
        });
        tracing::warn!(
            tenant_id,
            contact_id,
            reason_code = error.kind.as_str(),
            error = %error,
            "outbound send failed on every slot"
        );
        Err(error)
    }

    /// Preferred slot first, then the rest by load and slot number.
    fn candidate_slots(&self, tenant_id: &str, preferred: Option<u32>) -> Vec<ConnectionSlot> {
        let mut slots = self.slots.sendable_slots(tenant_id);
        slots.sort_by_key(|slot| {
            (
                Some(slot.slot_number) != preferred,
                slot.load,
                slot.slot_number,
            )
        });
        slots
    }

    fn record_success(&self, key: &ContactKey, slot: &ConnectionSlot) {
        if slot.rate_limit != RateLimitStatus::Normal {
            self.slots
                .set_rate_limit(&slot.tenant_id, slot.slot_number, RateLimitStatus::Normal);
        }
        let mut state = lock_unpoisoned(&self.state);
        state.affinity.insert(key.clone(), slot.slot_number);
        if let Some(multiplier) = state.pacing_multipliers.get_mut(&slot.tenant_id) {
            *multiplier = (*multiplier / 2).max(1);
        }
    }

    fn record_failure(&self, slot: &ConnectionSlot, error: &TransportError) {
        match error.kind {
            TransportErrorKind::RateLimited => {
                self.slots.set_rate_limit(
                    &slot.tenant_id,
                    slot.slot_number,
                    RateLimitStatus::Throttled,
                );
                if self.pacing.adaptive_pacing {
                    let max = self.pacing.adaptive_max_multiplier.max(1);
                    let mut state = lock_unpoisoned(&self.state);
                    let multiplier = state
                        .pacing_multipliers
                        .entry(slot.tenant_id.clone())
                        .or_insert(1);
                    *multiplier = multiplier.saturating_mul(2).min(max);
                }
            }
            TransportErrorKind::Blocked => {
                self.slots
                    .set_rate_limit(&slot.tenant_id, slot.slot_number, RateLimitStatus::Blocked);
            }
            _ => {}
        }
    }
}
