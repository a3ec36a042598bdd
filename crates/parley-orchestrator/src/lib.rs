//! Message orchestration core for Parley interviews.
//!
//! Exposes the per-contact response queue, the pure interview state machine
//! and its effect executor, tenant-scoped slot registry and round-robin
//! distribution, the cadence controller, outbound routing and the session
//! monitor, all wired together by [`InterviewEngine`].

pub mod cadence;
pub mod commands;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod interview_effects;
pub mod interview_machine;
mod locks;
pub mod outbound;
pub mod queue_manager;
pub mod session_monitor;
pub mod session_registry;
pub mod slot_registry;

pub use cadence::{
    CadenceController, CadenceDispatcher, CadenceError, CadenceStatus, DispatchRequest,
    DispatchStatus, ImmediateActivation, ImmediateActivationKind, ImmediateDelivery,
    PendingImmediate,
};
pub use commands::{classify_inbound, classify_payload, normalize_command_text, InboundIntent};
pub use config::{OrchestratorConfig, PacingConfig, ReplyTexts};
pub use distributor::{place_in_running_batch, round_robin_assign, RoundRobinDistributor};
pub use engine::{EngineCollaborators, ExpireOutcome, InboundOutcome, InterviewEngine};
pub use interview_effects::{EffectReport, InterviewEffectExecutor, QuestionSender};
pub use interview_machine::{
    transition, InterviewEffect, InterviewEvent, InterviewTransition, TransitionContext,
    TransitionOutcome,
};
pub use outbound::OutboundRouter;
pub use queue_manager::{
    ContactLease, EnqueueReceipt, QueueMetrics, QueuedMessageProcessor, ResponseQueueManager,
    SubmitOutcome,
};
pub use session_monitor::{
    start_session_monitor, MonitorSnapshot, SessionMonitor, SessionMonitorHandle,
    SessionMonitorOptions, MONITOR_SNAPSHOT_SCHEMA_VERSION,
};
pub use session_registry::SessionRegistry;
pub use slot_registry::{ConnectionSlotRegistry, IsolationViolation, SlotRegistryError};
