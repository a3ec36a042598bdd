//! Cadence controller: paced per-slot sending for batch invitations and the
//! immediate opt-in path.
//!
//! Each tenant has at most one active batch. Every slot of the batch owns a
//! lane (a FIFO of pending contacts) drained by one worker task that waits the
//! pacing delay between two sends. Immediate entries go to the front of their
//! lane and wake the worker so they do not wait out a long batch delay.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::duration_to_ms;
use parley_types::{
    CadenceBatch, CadenceMode, ConnectionSlot, Distribution, DistributionPriority,
    RateLimitStatus, TransportError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};

use crate::config::PacingConfig;
use crate::distributor::{place_in_running_batch, plan_distribution, RoundRobinDistributor};
use crate::locks::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};
use crate::outbound::OutboundRouter;
use crate::slot_registry::ConnectionSlotRegistry;

const CADENCE_REASON_BATCH_STARTED: &str = "cadence_batch_started";
const CADENCE_REASON_BATCH_MERGED: &str = "cadence_batch_merged";
const CADENCE_REASON_BATCH_DRAINED: &str = "cadence_batch_drained";
const CADENCE_REASON_BATCH_STOPPED: &str = "cadence_batch_stopped";
const CADENCE_REASON_NOTHING_SENDABLE: &str = "cadence_nothing_sendable";
const CADENCE_REASON_SLOT_RETRY: &str = "cadence_slot_retry";
const CADENCE_REASON_RETRY_EXHAUSTED: &str = "cadence_slot_retry_exhausted";
const CADENCE_REASON_TENANT_SUSPENDED: &str = "cadence_tenant_suspended";
const CADENCE_REASON_DISPATCH_SKIPPED: &str = "cadence_dispatch_skipped";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    #[error("cadence for tenant '{tenant_id}' is suspended until its configuration is resolved")]
    TenantSuspended { tenant_id: String },
    #[error("tenant '{tenant_id}' has no connected sendable slot")]
    NoActiveSlot { tenant_id: String },
    #[error("cadence workers require an active Tokio runtime")]
    NoRuntime,
}

/// One paced send handed to the [`CadenceDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub tenant_id: String,
    pub slot_number: u32,
    pub contact_id: String,
    pub mode: CadenceMode,
    /// Question an immediate send was queued for; `None` sends whatever is
    /// current when the lane gets to it.
    pub question_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DispatchStatus` values.
pub enum DispatchStatus {
    Sent,
    /// Nothing went out because the contact no longer needs this message.
    /// Neither the sent nor the error counter moves.
    Skipped,
}

#[async_trait]
/// Trait contract for `CadenceDispatcher` behavior.
pub trait CadenceDispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchStatus, TransportError>;
}

/// How a tracked immediate send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImmediateDelivery {
    Sent,
    Skipped,
    Failed(TransportError),
    /// The tenant was suspended first; the send stays queued until resume.
    Suspended,
    /// The entry left the lane without being dispatched (batch stopped).
    Dropped,
}

/// Immediate activation whose lane dispatch can be awaited.
#[derive(Debug)]
pub struct PendingImmediate {
    pub activation: ImmediateActivation,
    delivery: oneshot::Receiver<ImmediateDelivery>,
}

impl PendingImmediate {
    pub async fn delivered(self) -> ImmediateDelivery {
        self.delivery.await.unwrap_or(ImmediateDelivery::Dropped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ImmediateActivationKind` values.
pub enum ImmediateActivationKind {
    /// No batch was active; a new one holds only this contact.
    Created,
    /// Contact joined the running batch.
    Merged,
    /// Contact was still waiting in the batch and moved to the lane front.
    Promoted,
    /// Contact was already dispatched by the batch; a new send was queued.
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// Public struct `ImmediateActivation` returned by [`CadenceController::activate_immediate`].
pub struct ImmediateActivation {
    pub batch_id: u64,
    pub slot_number: u32,
    pub kind: ImmediateActivationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Per-tenant cadence figures for the monitor snapshot.
pub struct CadenceStatus {
    pub tenant_id: String,
    pub batch_id: Option<u64>,
    pub active: bool,
    pub contacts: usize,
    pub pending: usize,
    pub sent: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub suspended: bool,
}

#[derive(Debug)]
struct LaneEntry {
    contact_id: String,
    mode: CadenceMode,
    attempts: u32,
    batch_id: u64,
    question_index: Option<usize>,
    completion: Option<oneshot::Sender<ImmediateDelivery>>,
}

impl LaneEntry {
    fn new(contact_id: &str, mode: CadenceMode, batch_id: u64) -> Self {
        Self {
            contact_id: contact_id.to_string(),
            mode,
            attempts: 0,
            batch_id,
            question_index: None,
            completion: None,
        }
    }

    fn complete(&mut self, delivery: ImmediateDelivery) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(delivery);
        }
    }
}

#[derive(Debug, Default)]
struct Lane {
    entries: VecDeque<LaneEntry>,
    worker_running: bool,
    wake: Arc<Notify>,
}

#[derive(Debug)]
struct BatchState {
    batch_id: u64,
    active: bool,
    mode: CadenceMode,
    started_at: DateTime<Utc>,
    contacts: Vec<String>,
    placements: HashMap<String, u32>,
    pacing_delay: Duration,
    sent: u64,
    errors: u64,
    cursor: usize,
}

impl BatchState {
    fn snapshot(&self, tenant_id: &str) -> CadenceBatch {
        CadenceBatch {
            batch_id: self.batch_id,
            tenant_id: tenant_id.to_string(),
            active: self.active,
            mode: self.mode,
            started_at: self.started_at,
            contacts: self.contacts.clone(),
            pacing_delay_ms: duration_to_ms(self.pacing_delay),
            sent: self.sent,
            errors: self.errors,
        }
    }

    fn contains(&self, contact_id: &str) -> bool {
        self.placements.contains_key(contact_id)
    }
}

#[derive(Debug, Default)]
struct TenantCadence {
    batch: Option<BatchState>,
    lanes: BTreeMap<u32, Lane>,
    suspended: bool,
}

impl TenantCadence {
    fn active_batch_mut(&mut self) -> Option<&mut BatchState> {
        self.batch.as_mut().filter(|batch| batch.active)
    }

    fn pending(&self) -> usize {
        self.lanes.values().map(|lane| lane.entries.len()).sum()
    }

    /// Tells every tracked caller that its send now waits for a resume.
    fn notify_suspended(&mut self) {
        for lane in self.lanes.values_mut() {
            for entry in lane.entries.iter_mut() {
                entry.complete(ImmediateDelivery::Suspended);
            }
            lane.wake.notify_one();
        }
    }

    fn find_pending(&self, contact_id: &str) -> Option<(u32, usize)> {
        self.lanes.iter().find_map(|(slot_number, lane)| {
            lane.entries
                .iter()
                .position(|entry| entry.contact_id == contact_id)
                .map(|index| (*slot_number, index))
        })
    }
}

enum LaneStep {
    Send(LaneEntry),
    Wait(Duration),
    Exit,
}

struct CadenceInner {
    slots: Arc<ConnectionSlotRegistry>,
    router: Arc<OutboundRouter>,
    distributor: RoundRobinDistributor,
    dispatcher: Arc<dyn CadenceDispatcher>,
    pacing: PacingConfig,
    retry_max_attempts: u32,
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantCadence>>>>,
    next_batch_id: AtomicU64,
    active_workers: AtomicUsize,
}

/// Cadence controller. Cloning shares the same tenant state.
#[derive(Clone)]
pub struct CadenceController {
    inner: Arc<CadenceInner>,
}

impl CadenceController {
    pub fn new(
        slots: Arc<ConnectionSlotRegistry>,
        router: Arc<OutboundRouter>,
        dispatcher: Arc<dyn CadenceDispatcher>,
        pacing: PacingConfig,
        retry_max_attempts: u32,
    ) -> Self {
        let distributor = RoundRobinDistributor::new(slots.clone(), pacing.clone());
        Self {
            inner: Arc::new(CadenceInner {
                slots,
                router,
                distributor,
                dispatcher,
                pacing,
                retry_max_attempts,
                tenants: RwLock::new(HashMap::new()),
                next_batch_id: AtomicU64::new(1),
                active_workers: AtomicUsize::new(0),
            }),
        }
    }

    /// Plans `contacts` over the tenant's slots and starts paced sending.
    ///
    /// With a batch already active, new contacts are merged into it and the
    /// round-robin continues where the running batch left off. Contacts already
    /// in the batch are skipped. An empty plan means nothing is sendable yet.
    pub fn start_batch(
        &self,
        tenant_id: &str,
        contacts: &[String],
        priority: DistributionPriority,
    ) -> Result<Vec<Distribution>, CadenceError> {
        let handle = Handle::try_current().map_err(|_| CadenceError::NoRuntime)?;
        let tenant = self.inner.tenant(tenant_id);
        let mut state = lock_unpoisoned(&tenant);
        if state.suspended || self.inner.router.is_suspended(tenant_id) {
            return Err(CadenceError::TenantSuspended {
                tenant_id: tenant_id.to_string(),
            });
        }

        let mut seen = HashSet::new();
        let fresh = contacts
            .iter()
            .filter(|contact_id| !contact_id.trim().is_empty())
            .filter(|contact_id| seen.insert(contact_id.as_str()))
            .filter(|contact_id| {
                state
                    .batch
                    .as_ref()
                    .filter(|batch| batch.active)
                    .map_or(true, |batch| !batch.contains(contact_id))
            })
            .cloned()
            .collect::<Vec<_>>();

        let mut slots = self.inner.slots.sendable_slots(tenant_id);
        let cursor = state
            .batch
            .as_ref()
            .filter(|batch| batch.active)
            .map(|batch| batch.cursor)
            .unwrap_or(0);
        if !slots.is_empty() {
            let offset = cursor % slots.len();
            slots.rotate_left(offset);
        }
        let pacing_delay = self.inner.distributor.pacing_delay(priority);
        let plan = plan_distribution(
            tenant_id,
            &slots,
            &fresh,
            priority,
            pacing_delay,
            Utc::now(),
        );
        if plan.is_empty() || fresh.is_empty() {
            tracing::info!(
                tenant_id,
                contacts = contacts.len(),
                reason_code = CADENCE_REASON_NOTHING_SENDABLE,
                "cadence batch has nothing sendable"
            );
            return Ok(plan);
        }

        let merged = state.active_batch_mut().is_some();
        if !merged {
            state.batch = Some(BatchState {
                batch_id: self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed),
                active: true,
                mode: priority.cadence_mode(),
                started_at: Utc::now(),
                contacts: Vec::new(),
                placements: HashMap::new(),
                pacing_delay,
                sent: 0,
                errors: 0,
                cursor: 0,
            });
        }
        let Some(batch) = state.active_batch_mut() else {
            return Ok(plan);
        };
        if merged && priority.cadence_mode() == CadenceMode::Batch {
            batch.mode = CadenceMode::Batch;
            batch.pacing_delay = pacing_delay;
        }
        batch.cursor = batch.cursor.saturating_add(fresh.len());
        let batch_id = batch.batch_id;
        let mode = priority.cadence_mode();
        let mut lane_entries = Vec::new();
        for distribution in &plan {
            for contact_id in &distribution.contacts {
                batch.contacts.push(contact_id.clone());
                batch
                    .placements
                    .insert(contact_id.clone(), distribution.slot_number);
                lane_entries.push((
                    distribution.slot_number,
                    LaneEntry::new(contact_id, mode, batch_id),
                ));
            }
        }
        for (slot_number, entry) in lane_entries {
            self.inner.slots.increment_load(tenant_id, slot_number);
            state.lanes.entry(slot_number).or_default().entries.push_back(entry);
        }
        for distribution in &plan {
            self.inner
                .ensure_worker(&handle, &mut state, tenant_id, distribution.slot_number);
        }
        tracing::info!(
            tenant_id,
            batch_id,
            contacts = fresh.len(),
            slots = plan.len(),
            reason_code = if merged {
                CADENCE_REASON_BATCH_MERGED
            } else {
                CADENCE_REASON_BATCH_STARTED
            },
            "cadence batch planned"
        );
        Ok(plan)
    }

    /// Immediate path for a contact that opted in.
    ///
    /// Creates a single-contact batch when none is active, otherwise merges the
    /// contact into the running batch without duplicating it.
    pub fn activate_immediate(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<ImmediateActivation, CadenceError> {
        self.activate(tenant_id, contact_id, None, None)
    }

    /// Immediate activation pinned to `question_index`.
    ///
    /// The returned handle resolves once the lane has dispatched the entry or
    /// given up on it. The dispatcher skips the send when the contact has
    /// already moved past that question.
    pub fn activate_immediate_question(
        &self,
        tenant_id: &str,
        contact_id: &str,
        question_index: usize,
    ) -> Result<PendingImmediate, CadenceError> {
        let (completion, delivery) = oneshot::channel();
        let activation =
            self.activate(tenant_id, contact_id, Some(question_index), Some(completion))?;
        Ok(PendingImmediate {
            activation,
            delivery,
        })
    }

    fn activate(
        &self,
        tenant_id: &str,
        contact_id: &str,
        question_index: Option<usize>,
        completion: Option<oneshot::Sender<ImmediateDelivery>>,
    ) -> Result<ImmediateActivation, CadenceError> {
        let handle = Handle::try_current().map_err(|_| CadenceError::NoRuntime)?;
        let tenant = self.inner.tenant(tenant_id);
        let mut state = lock_unpoisoned(&tenant);
        if state.suspended || self.inner.router.is_suspended(tenant_id) {
            return Err(CadenceError::TenantSuspended {
                tenant_id: tenant_id.to_string(),
            });
        }
        let slots = self.inner.slots.sendable_slots(tenant_id);
        if slots.is_empty() {
            return Err(CadenceError::NoActiveSlot {
                tenant_id: tenant_id.to_string(),
            });
        }

        let pending = state.find_pending(contact_id);
        let (batch_id, slot_number, kind) = match state.active_batch_mut() {
            None => {
                let slot_number = place_in_running_batch(&slots, 0).ok_or_else(|| {
                    CadenceError::NoActiveSlot {
                        tenant_id: tenant_id.to_string(),
                    }
                })?;
                let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);
                state.batch = Some(BatchState {
                    batch_id,
                    active: true,
                    mode: CadenceMode::Immediate,
                    started_at: Utc::now(),
                    contacts: vec![contact_id.to_string()],
                    placements: HashMap::from([(contact_id.to_string(), slot_number)]),
                    pacing_delay: self.inner.pacing.immediate_delay,
                    sent: 0,
                    errors: 0,
                    cursor: 1,
                });
                (batch_id, slot_number, ImmediateActivationKind::Created)
            }
            Some(batch) if batch.contains(contact_id) => {
                let batch_id = batch.batch_id;
                match pending {
                    Some((slot_number, _)) => {
                        (batch_id, slot_number, ImmediateActivationKind::Promoted)
                    }
                    None => {
                        let placed = batch
                            .placements
                            .get(contact_id)
                            .copied()
                            .filter(|slot_number| {
                                slots.iter().any(|slot| slot.slot_number == *slot_number)
                            });
                        let slot_number = match placed {
                            Some(slot_number) => slot_number,
                            None => place_in_running_batch(&slots, batch.cursor).ok_or_else(
                                || CadenceError::NoActiveSlot {
                                    tenant_id: tenant_id.to_string(),
                                },
                            )?,
                        };
                        batch.placements.insert(contact_id.to_string(), slot_number);
                        (batch_id, slot_number, ImmediateActivationKind::Requeued)
                    }
                }
            }
            Some(batch) => {
                let slot_number = place_in_running_batch(&slots, batch.cursor).ok_or_else(
                    || CadenceError::NoActiveSlot {
                        tenant_id: tenant_id.to_string(),
                    },
                )?;
                batch.cursor = batch.cursor.saturating_add(1);
                batch.contacts.push(contact_id.to_string());
                batch
                    .placements
                    .insert(contact_id.to_string(), slot_number);
                (batch.batch_id, slot_number, ImmediateActivationKind::Merged)
            }
        };

        let mut entry = match (kind, pending) {
            (ImmediateActivationKind::Promoted, Some((slot, index))) => {
                let mut entry = state
                    .lanes
                    .get_mut(&slot)
                    .and_then(|lane| lane.entries.remove(index))
                    .unwrap_or_else(|| {
                        LaneEntry::new(contact_id, CadenceMode::Immediate, batch_id)
                    });
                entry.mode = CadenceMode::Immediate;
                entry
            }
            _ => {
                self.inner.slots.increment_load(tenant_id, slot_number);
                LaneEntry::new(contact_id, CadenceMode::Immediate, batch_id)
            }
        };
        if question_index.is_some() {
            entry.question_index = question_index;
        }
        if completion.is_some() {
            entry.complete(ImmediateDelivery::Skipped);
            entry.completion = completion;
        }
        let lane = state.lanes.entry(slot_number).or_default();
        lane.entries.push_front(entry);
        lane.wake.notify_one();
        self.inner
            .ensure_worker(&handle, &mut state, tenant_id, slot_number);
        tracing::info!(
            tenant_id,
            contact_id,
            batch_id,
            slot = slot_number,
            activation = ?kind,
            "immediate cadence activated"
        );
        Ok(ImmediateActivation {
            batch_id,
            slot_number,
            kind,
        })
    }

    /// Deactivates the tenant's batch and drops every pending send.
    pub fn stop_batch(&self, tenant_id: &str) -> Option<CadenceBatch> {
        let tenant = self.inner.existing_tenant(tenant_id)?;
        let mut state = lock_unpoisoned(&tenant);
        let mut dropped = 0_usize;
        for (slot_number, lane) in state.lanes.iter_mut() {
            for _ in lane.entries.drain(..) {
                self.inner.slots.decrement_load(tenant_id, *slot_number);
                dropped += 1;
            }
            lane.wake.notify_one();
        }
        let batch = state.batch.as_mut()?;
        batch.active = false;
        tracing::info!(
            tenant_id,
            batch_id = batch.batch_id,
            dropped,
            reason_code = CADENCE_REASON_BATCH_STOPPED,
            "cadence batch stopped"
        );
        Some(batch.snapshot(tenant_id))
    }

    /// Suspends sending for the tenant; pending contacts are kept.
    pub fn suspend_tenant(&self, tenant_id: &str) {
        self.inner.router.suspend_tenant(tenant_id);
        let tenant = self.inner.tenant(tenant_id);
        let mut state = lock_unpoisoned(&tenant);
        state.suspended = true;
        state.notify_suspended();
    }

    /// Lifts a suspension and restarts workers for lanes with pending contacts.
    pub fn resume_tenant(&self, tenant_id: &str) -> Result<bool, CadenceError> {
        let handle = Handle::try_current().map_err(|_| CadenceError::NoRuntime)?;
        let router_resumed = self.inner.router.resume_tenant(tenant_id);
        let Some(tenant) = self.inner.existing_tenant(tenant_id) else {
            return Ok(router_resumed);
        };
        let mut state = lock_unpoisoned(&tenant);
        let was_suspended = std::mem::replace(&mut state.suspended, false);
        let pending_lanes = state
            .lanes
            .iter()
            .filter(|(_, lane)| !lane.entries.is_empty())
            .map(|(slot_number, _)| *slot_number)
            .collect::<Vec<_>>();
        for slot_number in pending_lanes {
            self.inner
                .ensure_worker(&handle, &mut state, tenant_id, slot_number);
        }
        Ok(router_resumed || was_suspended)
    }

    pub fn is_suspended(&self, tenant_id: &str) -> bool {
        self.inner.router.is_suspended(tenant_id)
            || self
                .inner
                .existing_tenant(tenant_id)
                .is_some_and(|tenant| lock_unpoisoned(&tenant).suspended)
    }

    pub fn is_in_active_batch(&self, tenant_id: &str, contact_id: &str) -> bool {
        self.inner.existing_tenant(tenant_id).is_some_and(|tenant| {
            lock_unpoisoned(&tenant)
                .batch
                .as_ref()
                .is_some_and(|batch| batch.active && batch.contains(contact_id))
        })
    }

    /// Slot the contact is placed on in the tenant's active batch.
    pub fn placement(&self, tenant_id: &str, contact_id: &str) -> Option<u32> {
        let tenant = self.inner.existing_tenant(tenant_id)?;
        let state = lock_unpoisoned(&tenant);
        state
            .batch
            .as_ref()
            .filter(|batch| batch.active)
            .and_then(|batch| batch.placements.get(contact_id).copied())
    }

    /// Latest batch of the tenant, active or drained.
    pub fn batch(&self, tenant_id: &str) -> Option<CadenceBatch> {
        let tenant = self.inner.existing_tenant(tenant_id)?;
        let state = lock_unpoisoned(&tenant);
        state.batch.as_ref().map(|batch| batch.snapshot(tenant_id))
    }

    pub fn active_batch(&self, tenant_id: &str) -> Option<CadenceBatch> {
        self.batch(tenant_id).filter(|batch| batch.active)
    }

    pub fn statuses(&self) -> Vec<CadenceStatus> {
        let tenants = read_unpoisoned(&self.inner.tenants)
            .iter()
            .map(|(tenant_id, tenant)| (tenant_id.clone(), tenant.clone()))
            .collect::<BTreeMap<_, _>>();
        tenants
            .into_iter()
            .map(|(tenant_id, tenant)| {
                let state = lock_unpoisoned(&tenant);
                let batch = state.batch.as_ref();
                let snapshot = batch.map(|batch| batch.snapshot(&tenant_id));
                CadenceStatus {
                    batch_id: batch.map(|batch| batch.batch_id),
                    active: batch.is_some_and(|batch| batch.active),
                    contacts: batch.map(|batch| batch.contacts.len()).unwrap_or(0),
                    pending: state.pending(),
                    sent: batch.map(|batch| batch.sent).unwrap_or(0),
                    errors: batch.map(|batch| batch.errors).unwrap_or(0),
                    success_rate: snapshot
                        .as_ref()
                        .map(CadenceBatch::success_rate)
                        .unwrap_or(1.0),
                    suspended: state.suspended || self.inner.router.is_suspended(&tenant_id),
                    tenant_id,
                }
            })
            .collect()
    }

    /// True when no lane worker is running for any tenant.
    pub fn is_idle(&self) -> bool {
        self.inner.active_workers.load(Ordering::SeqCst) == 0
    }
}

impl CadenceInner {
    fn tenant(&self, tenant_id: &str) -> Arc<Mutex<TenantCadence>> {
        if let Some(tenant) = self.existing_tenant(tenant_id) {
            return tenant;
        }
        write_unpoisoned(&self.tenants)
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_tenant(&self, tenant_id: &str) -> Option<Arc<Mutex<TenantCadence>>> {
        read_unpoisoned(&self.tenants).get(tenant_id).cloned()
    }

    fn ensure_worker(
        self: &Arc<Self>,
        handle: &Handle,
        state: &mut TenantCadence,
        tenant_id: &str,
        slot_number: u32,
    ) {
        if state.suspended {
            return;
        }
        let lane = state.lanes.entry(slot_number).or_default();
        if lane.worker_running || lane.entries.is_empty() {
            return;
        }
        lane.worker_running = true;
        let wake = lane.wake.clone();
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        handle.spawn(async move {
            inner.run_lane(&tenant_id, slot_number, wake).await;
            inner.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn run_lane(&self, tenant_id: &str, slot_number: u32, wake: Arc<Notify>) {
        let mut last_sent: Option<Instant> = None;
        loop {
            match self.next_lane_step(tenant_id, slot_number, last_sent) {
                LaneStep::Exit => return,
                LaneStep::Wait(remaining) => {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = wake.notified() => {}
                    }
                }
                LaneStep::Send(entry) => {
                    let request = DispatchRequest {
                        tenant_id: tenant_id.to_string(),
                        slot_number,
                        contact_id: entry.contact_id.clone(),
                        mode: entry.mode,
                        question_index: entry.question_index,
                    };
                    let result = self.dispatcher.dispatch(&request).await;
                    last_sent = Some(Instant::now());
                    self.finish_entry(tenant_id, slot_number, entry, result);
                }
            }
        }
    }

    fn next_lane_step(
        &self,
        tenant_id: &str,
        slot_number: u32,
        last_sent: Option<Instant>,
    ) -> LaneStep {
        let tenant = self.tenant(tenant_id);
        let mut state = lock_unpoisoned(&tenant);
        if state.suspended {
            if let Some(lane) = state.lanes.get_mut(&slot_number) {
                lane.worker_running = false;
            }
            return LaneStep::Exit;
        }
        let batch_delay = state
            .batch
            .as_ref()
            .map(|batch| batch.pacing_delay)
            .unwrap_or(self.pacing.batch_delay);
        let Some(lane) = state.lanes.get_mut(&slot_number) else {
            return LaneStep::Exit;
        };
        let Some(front_mode) = lane.entries.front().map(|entry| entry.mode) else {
            lane.worker_running = false;
            self.deactivate_if_drained(tenant_id, &mut state);
            return LaneStep::Exit;
        };
        if let Some(last_sent) = last_sent {
            let delay = self.effective_delay(tenant_id, slot_number, front_mode, batch_delay);
            let elapsed = last_sent.elapsed();
            if elapsed < delay {
                return LaneStep::Wait(delay - elapsed);
            }
        }
        match lane.entries.pop_front() {
            Some(entry) => LaneStep::Send(entry),
            None => LaneStep::Exit,
        }
    }

    /// Base delay for the entry's mode, scaled by the tenant's adaptive
    /// multiplier and doubled on a throttled slot.
    fn effective_delay(
        &self,
        tenant_id: &str,
        slot_number: u32,
        mode: CadenceMode,
        batch_delay: Duration,
    ) -> Duration {
        let base = self.pacing.delay_for_mode(mode, batch_delay);
        if !self.pacing.adaptive_pacing {
            return base;
        }
        let multiplier = self.router.pacing_multiplier(tenant_id);
        let throttled = self
            .slots
            .slot(tenant_id, slot_number)
            .is_some_and(|slot: ConnectionSlot| slot.rate_limit == RateLimitStatus::Throttled);
        let factor = if throttled {
            multiplier.saturating_mul(2)
        } else {
            multiplier
        };
        base.saturating_mul(factor.max(1))
    }

    fn finish_entry(
        &self,
        tenant_id: &str,
        slot_number: u32,
        mut entry: LaneEntry,
        result: Result<DispatchStatus, TransportError>,
    ) {
        let tenant = self.tenant(tenant_id);
        let mut state = lock_unpoisoned(&tenant);
        let current_batch = state
            .batch
            .as_ref()
            .filter(|batch| batch.active && batch.batch_id == entry.batch_id)
            .is_some();
        match result {
            Ok(DispatchStatus::Sent) => {
                self.slots.decrement_load(tenant_id, slot_number);
                if let Some(batch) = state.batch.as_mut().filter(|_| current_batch) {
                    batch.sent = batch.sent.saturating_add(1);
                }
                entry.complete(ImmediateDelivery::Sent);
            }
            Ok(DispatchStatus::Skipped) => {
                self.slots.decrement_load(tenant_id, slot_number);
                tracing::debug!(
                    tenant_id,
                    slot = slot_number,
                    contact_id = %entry.contact_id,
                    reason_code = CADENCE_REASON_DISPATCH_SKIPPED,
                    "cadence send no longer needed"
                );
                entry.complete(ImmediateDelivery::Skipped);
            }
            Err(error) if error.is_configuration() && current_batch => {
                state.suspended = true;
                state
                    .lanes
                    .entry(slot_number)
                    .or_default()
                    .entries
                    .push_front(entry);
                state.notify_suspended();
                tracing::warn!(
                    tenant_id,
                    slot = slot_number,
                    reason_code = CADENCE_REASON_TENANT_SUSPENDED,
                    error = %error,
                    "cadence suspended for tenant"
                );
            }
            Err(error)
                if error.retryable()
                    && current_batch
                    && entry.attempts < self.retry_max_attempts =>
            {
                entry.attempts = entry.attempts.saturating_add(1);
                tracing::debug!(
                    tenant_id,
                    slot = slot_number,
                    contact_id = %entry.contact_id,
                    attempt = entry.attempts,
                    reason_code = CADENCE_REASON_SLOT_RETRY,
                    "cadence send will be retried"
                );
                state
                    .lanes
                    .entry(slot_number)
                    .or_default()
                    .entries
                    .push_back(entry);
            }
            Err(error) => {
                self.slots.decrement_load(tenant_id, slot_number);
                if let Some(batch) = state.batch.as_mut().filter(|_| current_batch) {
                    batch.errors = batch.errors.saturating_add(1);
                }
                tracing::warn!(
                    tenant_id,
                    slot = slot_number,
                    contact_id = %entry.contact_id,
                    attempts = entry.attempts,
                    reason_code = CADENCE_REASON_RETRY_EXHAUSTED,
                    error = %error,
                    "cadence send abandoned"
                );
                entry.complete(ImmediateDelivery::Failed(error));
            }
        }
    }

    fn deactivate_if_drained(&self, tenant_id: &str, state: &mut TenantCadence) {
        let drained = state
            .lanes
            .values()
            .all(|lane| lane.entries.is_empty() && !lane.worker_running);
        if !drained {
            return;
        }
        if let Some(batch) = state.batch.as_mut().filter(|batch| batch.active) {
            batch.active = false;
            tracing::info!(
                tenant_id,
                batch_id = batch.batch_id,
                sent = batch.sent,
                errors = batch.errors,
                reason_code = CADENCE_REASON_BATCH_DRAINED,
                "cadence batch drained"
            );
        }
    }
}
