//! Stable round-robin distribution of contacts over a tenant's active slots.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::duration_to_ms;
use parley_types::{ConnectionSlot, Distribution, DistributionPriority};

use crate::config::PacingConfig;
use crate::slot_registry::ConnectionSlotRegistry;

/// Assigns the contact at position `i` to slot `i mod k`.
///
/// Returns one list per slot in slot order; empty when `slot_count == 0`.
pub fn round_robin_assign<T: Clone>(items: &[T], slot_count: usize) -> Vec<Vec<T>> {
    if slot_count == 0 {
        return Vec::new();
    }
    let mut lanes = vec![Vec::new(); slot_count];
    for (index, item) in items.iter().enumerate() {
        lanes[index % slot_count].push(item.clone());
    }
    lanes
}

/// Chooses the slot for one contact merged into a running batch.
///
/// Picks the least-loaded slot; among equally loaded slots the one the
/// round-robin `cursor` would visit next wins.
pub fn place_in_running_batch(slots: &[ConnectionSlot], cursor: usize) -> Option<u32> {
    if slots.is_empty() {
        return None;
    }
    let preferred = cursor % slots.len();
    let min_load = slots.iter().map(|slot| slot.load).min()?;
    (0..slots.len())
        .map(|offset| (preferred + offset) % slots.len())
        .find(|index| slots[*index].load == min_load)
        .map(|index| slots[index].slot_number)
}

/// Builds [`Distribution`] plans from the slot registry.
#[derive(Debug, Clone)]
pub struct RoundRobinDistributor {
    slots: Arc<ConnectionSlotRegistry>,
    pacing: PacingConfig,
}

impl RoundRobinDistributor {
    pub fn new(slots: Arc<ConnectionSlotRegistry>, pacing: PacingConfig) -> Self {
        Self { slots, pacing }
    }

    pub fn pacing_delay(&self, priority: DistributionPriority) -> Duration {
        self.pacing.delay_for_priority(priority)
    }

    /// Splits `contacts` across the tenant's sendable slots.
    ///
    /// With no sendable slot the plan is empty: nothing is sendable yet.
    pub fn distribute(
        &self,
        tenant_id: &str,
        contacts: &[String],
        priority: DistributionPriority,
    ) -> Vec<Distribution> {
        let slots = self.slots.sendable_slots(tenant_id);
        plan_distribution(
            tenant_id,
            &slots,
            contacts,
            priority,
            self.pacing_delay(priority),
            Utc::now(),
        )
    }
}

pub fn plan_distribution(
    tenant_id: &str,
    slots: &[ConnectionSlot],
    contacts: &[String],
    priority: DistributionPriority,
    pacing_delay: Duration,
    now: DateTime<Utc>,
) -> Vec<Distribution> {
    let pacing_delay_ms = duration_to_ms(pacing_delay);
    round_robin_assign(contacts, slots.len())
        .into_iter()
        .zip(slots)
        .map(|(assigned, slot)| {
            let estimated_completion_ms =
                pacing_delay_ms.saturating_mul(u64::try_from(assigned.len()).unwrap_or(u64::MAX));
            let offset = i64::try_from(estimated_completion_ms).unwrap_or(i64::MAX);
            Distribution {
                tenant_id: tenant_id.to_string(),
                slot_number: slot.slot_number,
                contacts: assigned,
                priority,
                pacing_delay_ms,
                estimated_completion_ms,
                estimated_completion_at: now
                    .checked_add_signed(chrono::Duration::milliseconds(offset))
                    .unwrap_or(now),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use parley_types::RateLimitStatus;

    use super::*;

    fn slot(slot_number: u32, load: usize) -> ConnectionSlot {
        ConnectionSlot {
            tenant_id: "acme".to_string(),
            slot_number,
            connected: true,
            identity: format!("+55{slot_number}"),
            load,
            rate_limit: RateLimitStatus::Normal,
        }
    }

    fn contacts(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("c{index}")).collect()
    }

    #[test]
    fn unit_seven_contacts_over_three_slots_follow_modulo_order() {
        let plan = plan_distribution(
            "acme",
            &[slot(0, 0), slot(1, 0), slot(2, 0)],
            &contacts(7),
            DistributionPriority::Normal,
            Duration::from_secs(8),
            Utc::now(),
        );
        let sizes = plan
            .iter()
            .map(|distribution| distribution.contacts.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(plan[0].contacts, vec!["c0", "c3", "c6"]);
        assert_eq!(plan[1].contacts, vec!["c1", "c4"]);
        assert_eq!(plan[0].estimated_completion_ms, 24_000);
        assert_eq!(plan[2].estimated_completion_ms, 16_000);
    }

    #[test]
    fn unit_slot_sizes_differ_by_at_most_one() {
        for slot_count in 1..6 {
            for contact_count in 0..20 {
                let lanes = round_robin_assign(&contacts(contact_count), slot_count);
                let max = lanes.iter().map(Vec::len).max().unwrap_or(0);
                let min = lanes.iter().map(Vec::len).min().unwrap_or(0);
                assert!(max - min <= 1, "n={contact_count} k={slot_count}");
                assert_eq!(lanes.iter().map(Vec::len).sum::<usize>(), contact_count);
            }
        }
    }

    #[test]
    fn regression_zero_slots_yield_empty_plan() {
        assert!(round_robin_assign(&contacts(4), 0).is_empty());
        let plan = plan_distribution(
            "acme",
            &[],
            &contacts(4),
            DistributionPriority::Urgent,
            Duration::from_secs(3),
            Utc::now(),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn unit_merge_placement_prefers_least_loaded_then_round_robin_cursor() {
        let slots = [slot(0, 1), slot(1, 1), slot(2, 0)];
        assert_eq!(place_in_running_batch(&slots, 0), Some(2));
        let tied = [slot(0, 1), slot(1, 1), slot(2, 1)];
        assert_eq!(place_in_running_batch(&tied, 2), Some(2));
        assert_eq!(place_in_running_batch(&tied, 4), Some(1));
        assert_eq!(place_in_running_batch(&[], 1), None);
    }

    #[test]
    fn functional_distributor_uses_sendable_slots_from_registry() {
        let registry = Arc::new(ConnectionSlotRegistry::new());
        registry.connect("acme", 0, "+550").expect("connect");
        registry.connect("acme", 1, "+551").expect("connect");
        registry.set_rate_limit("acme", 1, RateLimitStatus::Blocked);
        let distributor = RoundRobinDistributor::new(registry, PacingConfig::default());
        let plan = distributor.distribute("acme", &contacts(3), DistributionPriority::Normal);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].contacts.len(), 3);
        assert!(distributor
            .distribute("globex", &contacts(3), DistributionPriority::Normal)
            .is_empty());
    }
}
