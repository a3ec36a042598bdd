//! Per-tenant connection slot registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use parley_types::{ConnectionSlot, RateLimitStatus};
use serde::Serialize;
use thiserror::Error;

use crate::locks::{read_unpoisoned, write_unpoisoned};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotRegistryError {
    #[error(
        "identity '{identity}' is already bound to tenant '{bound_tenant}' and cannot be connected for '{tenant_id}'"
    )]
    IsolationViolation {
        identity: String,
        tenant_id: String,
        bound_tenant: String,
    },
    #[error("slot identity must not be empty")]
    EmptyIdentity,
}

/// One identity found connected under more than one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationViolation {
    pub identity: String,
    pub tenants: Vec<String>,
}

/// Connection slots grouped by tenant. Slots of one tenant are never visible
/// through another tenant's lookups.
#[derive(Debug, Default)]
pub struct ConnectionSlotRegistry {
    tenants: RwLock<BTreeMap<String, BTreeMap<u32, ConnectionSlot>>>,
}

impl ConnectionSlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to the tenant's slot and marks it connected.
    ///
    /// Refuses an identity that is currently connected under another tenant.
    pub fn connect(
        &self,
        tenant_id: &str,
        slot_number: u32,
        identity: &str,
    ) -> Result<ConnectionSlot, SlotRegistryError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(SlotRegistryError::EmptyIdentity);
        }
        let mut tenants = write_unpoisoned(&self.tenants);
        if let Some(bound_tenant) = tenants
            .iter()
            .filter(|(owner, _)| owner.as_str() != tenant_id)
            .find(|(_, slots)| {
                slots
                    .values()
                    .any(|slot| slot.connected && slot.identity == identity)
            })
            .map(|(owner, _)| owner.clone())
        {
            return Err(SlotRegistryError::IsolationViolation {
                identity: identity.to_string(),
                tenant_id: tenant_id.to_string(),
                bound_tenant,
            });
        }

        let slots = tenants.entry(tenant_id.to_string()).or_default();
        let slot = slots
            .entry(slot_number)
            .or_insert_with(|| ConnectionSlot {
                tenant_id: tenant_id.to_string(),
                slot_number,
                connected: false,
                identity: identity.to_string(),
                load: 0,
                rate_limit: RateLimitStatus::Normal,
            });
        if slot.identity != identity {
            slot.identity = identity.to_string();
            slot.rate_limit = RateLimitStatus::Normal;
        }
        slot.connected = true;
        tracing::info!(
            tenant_id,
            slot = slot_number,
            identity,
            "connection slot connected"
        );
        Ok(slot.clone())
    }

    /// Marks the slot disconnected; returns false when it is unknown.
    pub fn disconnect(&self, tenant_id: &str, slot_number: u32) -> bool {
        let mut tenants = write_unpoisoned(&self.tenants);
        let Some(slot) = tenants
            .get_mut(tenant_id)
            .and_then(|slots| slots.get_mut(&slot_number))
        else {
            return false;
        };
        slot.connected = false;
        tracing::info!(tenant_id, slot = slot_number, "connection slot disconnected");
        true
    }

    pub fn slot(&self, tenant_id: &str, slot_number: u32) -> Option<ConnectionSlot> {
        read_unpoisoned(&self.tenants)
            .get(tenant_id)
            .and_then(|slots| slots.get(&slot_number))
            .cloned()
    }

    /// Connected slots of the tenant ordered by slot number.
    pub fn get_active_slots(&self, tenant_id: &str) -> Vec<ConnectionSlot> {
        read_unpoisoned(&self.tenants)
            .get(tenant_id)
            .map(|slots| {
                slots
                    .values()
                    .filter(|slot| slot.connected)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Connected, non-blocked slots of the tenant ordered by slot number.
    pub fn sendable_slots(&self, tenant_id: &str) -> Vec<ConnectionSlot> {
        self.get_active_slots(tenant_id)
            .into_iter()
            .filter(ConnectionSlot::is_sendable)
            .collect()
    }

    /// Sendable slot with the lowest load; ties go to the lowest slot number.
    pub fn least_loaded(&self, tenant_id: &str) -> Option<ConnectionSlot> {
        self.sendable_slots(tenant_id)
            .into_iter()
            .min_by_key(|slot| (slot.load, slot.slot_number))
    }

    pub fn set_rate_limit(&self, tenant_id: &str, slot_number: u32, status: RateLimitStatus) {
        let mut tenants = write_unpoisoned(&self.tenants);
        if let Some(slot) = tenants
            .get_mut(tenant_id)
            .and_then(|slots| slots.get_mut(&slot_number))
        {
            if slot.rate_limit != status {
                tracing::debug!(
                    tenant_id,
                    slot = slot_number,
                    rate_limit = status.as_str(),
                    "slot rate-limit status changed"
                );
            }
            slot.rate_limit = status;
        }
    }

    pub fn increment_load(&self, tenant_id: &str, slot_number: u32) {
        self.adjust_load(tenant_id, slot_number, |load| load.saturating_add(1));
    }

    pub fn decrement_load(&self, tenant_id: &str, slot_number: u32) {
        self.adjust_load(tenant_id, slot_number, |load| load.saturating_sub(1));
    }

    fn adjust_load(&self, tenant_id: &str, slot_number: u32, apply: impl FnOnce(usize) -> usize) {
        let mut tenants = write_unpoisoned(&self.tenants);
        if let Some(slot) = tenants
            .get_mut(tenant_id)
            .and_then(|slots| slots.get_mut(&slot_number))
        {
            slot.load = apply(slot.load);
        }
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        read_unpoisoned(&self.tenants).keys().cloned().collect()
    }

    /// Every identity currently connected under more than one tenant.
    pub fn audit_tenant_isolation(&self) -> Vec<IsolationViolation> {
        let tenants = read_unpoisoned(&self.tenants);
        let mut owners: HashMap<&str, Vec<String>> = HashMap::new();
        for (tenant_id, slots) in tenants.iter() {
            for slot in slots.values().filter(|slot| slot.connected) {
                let entry = owners.entry(slot.identity.as_str()).or_default();
                if !entry.contains(tenant_id) {
                    entry.push(tenant_id.clone());
                }
            }
        }
        let mut violations = owners
            .into_iter()
            .filter(|(_, tenants)| tenants.len() > 1)
            .map(|(identity, tenants)| IsolationViolation {
                identity: identity.to_string(),
                tenants,
            })
            .collect::<Vec<_>>();
        violations.sort_by(|left, right| left.identity.cmp(&right.identity));
        violations
    }
}
