//! Collaborator contracts consumed by the Parley orchestrator.
//!
//! Each external subsystem (messaging gateway, candidate directory, interview
//! record persistence, audio storage, transcription, speech synthesis, answer
//! scoring) is reached through a narrow async trait. In-memory and
//! deterministic backends live alongside the contracts for local runs and tests.

pub mod directory;
pub mod http_gateway;
pub mod inbound_envelope;
pub mod records;
pub mod scoring;
pub mod transport;
pub mod voice;

pub use directory::{CandidateDirectory, DirectoryError, InMemoryCandidateDirectory};
pub use http_gateway::{HttpMessagingGateway, HttpMessagingGatewayConfig};
pub use inbound_envelope::{parse_inbound_envelope, InboundEnvelopeError};
pub use records::{
    InMemoryInterviewRecordStore, InterviewRecord, InterviewRecordDraft, InterviewRecordStore,
    PersistenceError,
};
pub use scoring::{KeywordOverlapScorer, ScoringError, ScoringProvider, ScoringRequest};
pub use transport::{
    DeliveryReceipt, MessagingTransport, OutboundAudio, OutboundBody, OutboundRecord,
    RecordingTransport,
};
pub use voice::{
    AudioClip, AudioStore, AudioStoreError, DeterministicVoiceProvider, InMemoryAudioStore,
    SttProvider, SttRequest, SttResponse, TtsProvider, TtsRequest, TtsResponse,
    VoiceProviderError, VoiceProviderResult, VOICE_REASON_BACKEND_FAILED,
    VOICE_REASON_EMPTY_AUDIO, VOICE_REASON_EMPTY_TEXT, VOICE_REASON_EMPTY_TRANSCRIPT,
    VOICE_REASON_UNDECODABLE_AUDIO,
};
