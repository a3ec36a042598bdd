//! Shared data model for the Parley interview orchestration engine.
//!
//! Sessions, queued messages, connection slots, cadence batches and
//! distributions, plus the error taxonomy surfaced by the orchestrator.

mod cadence;
mod errors;
mod messages;
mod session;
mod slots;

pub use cadence::{CadenceBatch, CadenceMode, Distribution, DistributionPriority};
pub use errors::{
    OrchestratorError, StateError, StatusTransitionError, TransportError, TransportErrorKind,
};
pub use messages::{InboundMessageEvent, MessagePayload, QueuedMessage};
pub use session::{
    CandidateProfile, ContactKey, InterviewAssignment, InterviewDefinition, InterviewQuestion,
    InterviewStatus, RecordedResponse, Session, SessionView,
};
pub use slots::{ConnectionSlot, RateLimitStatus};
