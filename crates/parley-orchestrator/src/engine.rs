//! Interview engine: wires registries, queue manager, cadence controller and
//! effect executor behind one handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_connectors::{
    AudioStore, CandidateDirectory, DirectoryError, InterviewRecordStore, MessagingTransport,
    ScoringProvider, SttProvider, SttRequest, TtsProvider,
};
use parley_types::{
    CadenceBatch, CadenceMode, ConnectionSlot, ContactKey, Distribution, DistributionPriority,
    InboundMessageEvent, InterviewAssignment, InterviewStatus, MessagePayload, OrchestratorError,
    QueuedMessage, Session, SessionView, TransportError, TransportErrorKind,
};
use serde::Serialize;

use crate::cadence::{
    CadenceController, CadenceDispatcher, CadenceError, DispatchRequest, DispatchStatus,
};
use crate::commands::{classify_payload, InboundIntent};
use crate::config::OrchestratorConfig;
use crate::interview_effects::{InterviewEffectExecutor, QuestionSender};
use crate::interview_machine::{
    transition, InterviewEvent, TransitionContext, TransitionOutcome,
};
use crate::outbound::OutboundRouter;
use crate::queue_manager::{QueuedMessageProcessor, ResponseQueueManager, SubmitOutcome};
use crate::session_registry::SessionRegistry;
use crate::slot_registry::{ConnectionSlotRegistry, SlotRegistryError};

const INBOUND_REASON_UNRESOLVED_TENANT: &str = "inbound_dropped_unresolved_tenant";
const INBOUND_REASON_AMBIGUOUS_TENANT: &str = "inbound_dropped_ambiguous_tenant";
const INBOUND_REASON_DIRECTORY_FAILED: &str = "inbound_dropped_directory_error";
const INBOUND_REASON_MISSING_CONTACT: &str = "inbound_dropped_missing_contact";
const ENGINE_REASON_TRANSCRIPTION_FAILED: &str = "transcription_failed_placeholder_stored";
const ENGINE_REASON_AUDIO_ARCHIVE_FAILED: &str = "audio_archive_failed";
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// External collaborators the engine is built from.
#[derive(Clone)]
pub struct EngineCollaborators {
    pub transport: Arc<dyn MessagingTransport>,
    pub directory: Arc<dyn CandidateDirectory>,
    pub records: Arc<dyn InterviewRecordStore>,
    pub stt: Option<Arc<dyn SttProvider>>,
    pub tts: Option<Arc<dyn TtsProvider>>,
    pub audio_store: Option<Arc<dyn AudioStore>>,
    pub scorer: Option<Arc<dyn ScoringProvider>>,
}

impl EngineCollaborators {
    pub fn new(
        transport: Arc<dyn MessagingTransport>,
        directory: Arc<dyn CandidateDirectory>,
        records: Arc<dyn InterviewRecordStore>,
    ) -> Self {
        Self {
            transport,
            directory,
            records,
            stt: None,
            tts: None,
            audio_store: None,
            scorer: None,
        }
    }

    pub fn with_stt(mut self, stt: Arc<dyn SttProvider>) -> Self {
        self.stt = Some(stt);
        self
    }

    pub fn with_tts(mut self, tts: Arc<dyn TtsProvider>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn with_audio_store(mut self, audio_store: Arc<dyn AudioStore>) -> Self {
        self.audio_store = Some(audio_store);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringProvider>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
/// Enumerates supported `InboundOutcome` values.
pub enum InboundOutcome {
    Queued { submit: SubmitOutcome },
    Dropped { reason_code: &'static str },
}

impl InboundOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ExpireOutcome` values.
pub enum ExpireOutcome {
    Evicted,
    /// The contact is being processed; the next sweep retries.
    Busy,
    NotIdle,
    Missing,
}

struct InterviewDispatcher {
    sessions: Arc<SessionRegistry>,
    router: Arc<OutboundRouter>,
    questions: Arc<QuestionSender>,
    invitation_text: String,
}

#[async_trait]
impl CadenceDispatcher for InterviewDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchStatus, TransportError> {
        let key = ContactKey::new(request.tenant_id.as_str(), request.contact_id.as_str());
        let session = self.sessions.get(&key);
        match request.mode {
            CadenceMode::Batch => {
                if session.is_some() {
                    tracing::debug!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        "invitation skipped for contact with live session"
                    );
                    return Ok(DispatchStatus::Skipped);
                }
                self.router
                    .send_text(
                        &key.tenant_id,
                        &key.contact_id,
                        &self.invitation_text,
                        Some(request.slot_number),
                    )
                    .await?;
                if !self.sessions.contains(&key) {
                    self.router.forget(&key);
                }
                Ok(DispatchStatus::Sent)
            }
            CadenceMode::Immediate => {
                let Some(session) = session else {
                    return Ok(DispatchStatus::Skipped);
                };
                let question_index = request
                    .question_index
                    .unwrap_or_else(|| session.current_question_index());
                let awaiting = InterviewStatus::AwaitingResponse { question_index };
                let question = session
                    .questions
                    .get(question_index)
                    .filter(|_| session.status() == awaiting);
                let Some(question) = question else {
                    tracing::debug!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        question_index,
                        status = %session.status(),
                        "immediate question already passed"
                    );
                    return Ok(DispatchStatus::Skipped);
                };
                self.questions
                    .send_question(&key, question, Some(request.slot_number))
                    .await?;
                Ok(DispatchStatus::Sent)
            }
        }
    }
}

struct EngineInner {
    config: OrchestratorConfig,
    sessions: Arc<SessionRegistry>,
    slots: Arc<ConnectionSlotRegistry>,
    router: Arc<OutboundRouter>,
    queue: ResponseQueueManager,
    cadence: CadenceController,
    executor: InterviewEffectExecutor,
    directory: Arc<dyn CandidateDirectory>,
    stt: Option<Arc<dyn SttProvider>>,
    audio_store: Option<Arc<dyn AudioStore>>,
}

/// Message orchestration engine. Cloning shares the same state.
#[derive(Clone)]
pub struct InterviewEngine {
    inner: Arc<EngineInner>,
}

impl InterviewEngine {
    pub fn new(config: OrchestratorConfig, collaborators: EngineCollaborators) -> Result<Self> {
        config
            .validate()
            .context("invalid orchestrator configuration")?;
        let sessions = Arc::new(SessionRegistry::new());
        let slots = Arc::new(ConnectionSlotRegistry::new());
        let router = Arc::new(OutboundRouter::new(
            slots.clone(),
            collaborators.transport.clone(),
            config.pacing.clone(),
        ));
        let questions = Arc::new(QuestionSender::new(
            router.clone(),
            collaborators.tts.clone(),
        ));
        let dispatcher = Arc::new(InterviewDispatcher {
            sessions: sessions.clone(),
            router: router.clone(),
            questions: questions.clone(),
            invitation_text: config.replies.invitation_text.clone(),
        });
        let cadence = CadenceController::new(
            slots.clone(),
            router.clone(),
            dispatcher,
            config.pacing.clone(),
            config.cadence_retry_max_attempts,
        );
        let executor = InterviewEffectExecutor::new(
            sessions.clone(),
            collaborators.records.clone(),
            router.clone(),
            cadence.clone(),
            questions,
            collaborators.scorer.clone(),
        );
        tracing::info!(
            transport = router.transport_name(),
            idle_timeout_secs = config.session_idle_timeout.as_secs(),
            "interview engine initialized"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                queue: ResponseQueueManager::new(config.latency_window),
                config,
                sessions,
                slots,
                router,
                cadence,
                executor,
                directory: collaborators.directory,
                stt: collaborators.stt,
                audio_store: collaborators.audio_store,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn slots(&self) -> &ConnectionSlotRegistry {
        &self.inner.slots
    }

    pub fn queue(&self) -> &ResponseQueueManager {
        &self.inner.queue
    }

    pub fn cadence(&self) -> &CadenceController {
        &self.inner.cadence
    }

    pub fn router(&self) -> &OutboundRouter {
        &self.inner.router
    }

    /// Resolves the tenant and queues the message under the contact's key.
    pub async fn handle_inbound(&self, event: InboundMessageEvent) -> InboundOutcome {
        let contact_id = event.contact_id.trim();
        if contact_id.is_empty() {
            tracing::warn!(
                reason_code = INBOUND_REASON_MISSING_CONTACT,
                "inbound message dropped"
            );
            return InboundOutcome::Dropped {
                reason_code: INBOUND_REASON_MISSING_CONTACT,
            };
        }
        let tenant_id = match event
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|tenant_id| !tenant_id.is_empty())
        {
            Some(tenant_id) => tenant_id.to_string(),
            None => match self.inner.directory.resolve_tenant(contact_id).await {
                Ok(Some(tenant_id)) => tenant_id,
                Ok(None) => return dropped(contact_id, INBOUND_REASON_UNRESOLVED_TENANT, None),
                Err(error @ DirectoryError::AmbiguousTenant { .. }) => {
                    return dropped(
                        contact_id,
                        INBOUND_REASON_AMBIGUOUS_TENANT,
                        Some(error.to_string()),
                    )
                }
                Err(error) => {
                    return dropped(
                        contact_id,
                        INBOUND_REASON_DIRECTORY_FAILED,
                        Some(error.to_string()),
                    )
                }
            },
        };

        let key = ContactKey::new(tenant_id, contact_id);
        let processor: Arc<dyn QueuedMessageProcessor> = self.inner.clone();
        let submit = self.inner.queue.submit(&key, event.payload(), processor);
        InboundOutcome::Queued { submit }
    }

    /// Distributes `contacts` over the tenant's slots and starts paced invitations.
    pub fn start_invitations(
        &self,
        tenant_id: &str,
        contacts: &[String],
        priority: DistributionPriority,
    ) -> Result<Vec<Distribution>, OrchestratorError> {
        self.inner
            .cadence
            .start_batch(tenant_id, contacts, priority)
            .map_err(|error| cadence_error(tenant_id, error))
    }

    pub fn stop_invitations(&self, tenant_id: &str) -> Option<CadenceBatch> {
        self.inner.cadence.stop_batch(tenant_id)
    }

    pub fn connect_slot(
        &self,
        tenant_id: &str,
        slot_number: u32,
        identity: &str,
    ) -> Result<ConnectionSlot, SlotRegistryError> {
        self.inner.slots.connect(tenant_id, slot_number, identity)
    }

    pub fn disconnect_slot(&self, tenant_id: &str, slot_number: u32) -> bool {
        self.inner.slots.disconnect(tenant_id, slot_number)
    }

    pub fn get_active_slots(&self, tenant_id: &str) -> Vec<ConnectionSlot> {
        self.inner.slots.get_active_slots(tenant_id)
    }

    /// Suspends every send for the tenant until [`Self::resume_tenant`].
    pub fn suspend_tenant(&self, tenant_id: &str) {
        self.inner.cadence.suspend_tenant(tenant_id);
    }

    pub fn resume_tenant(&self, tenant_id: &str) -> Result<bool, OrchestratorError> {
        self.inner
            .cadence
            .resume_tenant(tenant_id)
            .map_err(|error| cadence_error(tenant_id, error))
    }

    pub fn session(&self, key: &ContactKey) -> Option<Session> {
        self.inner.sessions.get(key)
    }

    pub fn session_views(&self, now: DateTime<Utc>) -> Vec<SessionView> {
        self.inner.sessions.views(now)
    }

    /// Times out the session when it is idle beyond the configured threshold.
    ///
    /// Runs under the contact's queue lease so it never overlaps message
    /// processing for the same contact.
    pub async fn expire_session(&self, key: &ContactKey, now: DateTime<Utc>) -> ExpireOutcome {
        let Some(lease) = self.inner.queue.try_lease(key) else {
            return ExpireOutcome::Busy;
        };
        let outcome = match self.inner.sessions.get(key) {
            None => ExpireOutcome::Missing,
            Some(session) if !session.is_idle(now, self.inner.config.session_idle_timeout) => {
                ExpireOutcome::NotIdle
            }
            Some(session) => {
                let ctx = self.inner.transition_context(false);
                let planned = transition(Some(&session), InterviewEvent::IdleTimeout, &ctx);
                let report = self
                    .inner
                    .executor
                    .execute(key, planned.effects, now)
                    .await;
                tracing::info!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    idle_seconds = session.idle_for(now).as_secs(),
                    reason_code = planned.outcome.reason_code(),
                    clean = report.is_clean(),
                    "idle session evicted"
                );
                ExpireOutcome::Evicted
            }
        };
        drop(lease);
        let processor: Arc<dyn QueuedMessageProcessor> = self.inner.clone();
        self.inner.queue.resume(key, processor);
        outcome
    }

    /// True when no contact has queued or in-flight work and no cadence lane runs.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle() && self.inner.cadence.is_idle()
    }

    /// Polls until [`Self::is_idle`] holds; false when `timeout` elapses first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

fn dropped(contact_id: &str, reason_code: &'static str, error: Option<String>) -> InboundOutcome {
    tracing::warn!(
        contact_id,
        reason_code,
        error = error.as_deref().unwrap_or("none"),
        "inbound message dropped"
    );
    InboundOutcome::Dropped { reason_code }
}

fn cadence_error(tenant_id: &str, error: CadenceError) -> OrchestratorError {
    match error {
        CadenceError::NoActiveSlot { tenant_id } => OrchestratorError::Transport(
            TransportError::new(
                TransportErrorKind::NoActiveSlot,
                tenant_id,
                None,
                "tenant has no connected sendable slot",
            ),
        ),
        error => OrchestratorError::Configuration {
            tenant_id: tenant_id.to_string(),
            reason: error.to_string(),
        },
    }
}

impl EngineInner {
    fn transition_context(&self, in_active_batch: bool) -> TransitionContext<'_> {
        let replies = &self.config.replies;
        TransitionContext {
            in_active_batch,
            question_delay: self.config.question_delay,
            menu_prompt: &replies.menu_prompt,
            closing_text: &replies.closing_text,
            opt_out_ack_text: &replies.opt_out_ack_text,
            start_failed_text: &replies.start_failed_text,
        }
    }

    async fn prepare_event(
        &self,
        key: &ContactKey,
        intent: InboundIntent,
        payload: &MessagePayload,
        has_session: bool,
    ) -> InterviewEvent {
        match intent {
            InboundIntent::OptIn => InterviewEvent::OptIn {
                assignment: self.resolve_assignment(key).await,
            },
            InboundIntent::OptOut => InterviewEvent::OptOut,
            InboundIntent::Stop => InterviewEvent::Stop,
            InboundIntent::Response(_) if !has_session => InterviewEvent::Unrecognized,
            InboundIntent::Response(text) => match payload.audio_ref.as_deref() {
                Some(audio_ref) if payload.has_audio() => {
                    self.transcribe_response(key, audio_ref.trim(), text).await
                }
                _ => InterviewEvent::Response {
                    text,
                    audio_ref: None,
                    pending_transcription: false,
                },
            },
            InboundIntent::Empty => InterviewEvent::Unrecognized,
        }
    }

    async fn resolve_assignment(&self, key: &ContactKey) -> Option<InterviewAssignment> {
        let candidate = self
            .directory
            .find_candidate(&key.tenant_id, &key.contact_id)
            .await;
        let interview = self.directory.active_interview(&key.tenant_id).await;
        match (candidate, interview) {
            (Ok(Some(candidate)), Ok(Some(interview))) => Some(InterviewAssignment {
                candidate,
                interview,
            }),
            (Err(error), _) | (_, Err(error)) => {
                let error = OrchestratorError::Directory(error.to_string());
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    reason_code = error.reason_code(),
                    error = %error,
                    "opt-in could not be resolved"
                );
                None
            }
            _ => {
                let error = OrchestratorError::ContactNotFound {
                    tenant_id: key.tenant_id.clone(),
                    contact_id: key.contact_id.clone(),
                };
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    reason_code = error.reason_code(),
                    "opt-in without candidate or active interview"
                );
                None
            }
        }
    }

    /// Archives the audio and transcribes it; on any failure the response is
    /// stored with the accompanying text or the placeholder.
    async fn transcribe_response(
        &self,
        key: &ContactKey,
        audio_ref: &str,
        text: String,
    ) -> InterviewEvent {
        let clip = match &self.audio_store {
            Some(store) => match store
                .archive(&key.tenant_id, &key.contact_id, audio_ref)
                .await
            {
                Ok(clip) => Some(clip),
                Err(error) => {
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        reason_code = ENGINE_REASON_AUDIO_ARCHIVE_FAILED,
                        error = %error,
                        "audio response could not be archived"
                    );
                    None
                }
            },
            None => None,
        };
        let stored_ref = clip
            .as_ref()
            .map(|clip| clip.stored_ref.clone())
            .unwrap_or_else(|| audio_ref.to_string());

        let transcript = match (&self.stt, clip) {
            (Some(stt), Some(clip)) => {
                stt.transcribe(SttRequest::new(clip.bytes).with_mime_type(clip.mime_type))
                    .await
                    .map(|response| response.transcript)
                    .map_err(|error| OrchestratorError::Transcription(error.to_string()))
            }
            (None, _) => Err(OrchestratorError::Transcription(
                "no transcription provider configured".to_string(),
            )),
            (Some(_), None) => Err(OrchestratorError::Transcription(
                "audio unavailable for transcription".to_string(),
            )),
        };

        match transcript {
            Ok(transcript) => InterviewEvent::Response {
                text: transcript,
                audio_ref: Some(stored_ref),
                pending_transcription: false,
            },
            Err(error) => {
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    reason_code = ENGINE_REASON_TRANSCRIPTION_FAILED,
                    error = %error,
                    "storing audio response with placeholder"
                );
                let text = if text.trim().is_empty() {
                    self.config.replies.transcription_placeholder.clone()
                } else {
                    text
                };
                InterviewEvent::Response {
                    text,
                    audio_ref: Some(stored_ref),
                    pending_transcription: true,
                }
            }
        }
    }
}

#[async_trait]
impl QueuedMessageProcessor for EngineInner {
    async fn process(&self, message: QueuedMessage) -> Result<(), OrchestratorError> {
        let key = message.key;
        let session = self.sessions.get(&key);
        let intent = classify_payload(&message.payload, session.is_some());
        let event = self
            .prepare_event(&key, intent, &message.payload, session.is_some())
            .await;
        let event_name = event.as_str();
        let ctx = self.transition_context(
            self.cadence
                .is_in_active_batch(&key.tenant_id, &key.contact_id),
        );
        let planned = transition(session.as_ref(), event, &ctx);
        match &planned.outcome {
            TransitionOutcome::Dropped(error) => {
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    message_id = message.id,
                    event = event_name,
                    reason_code = planned.outcome.reason_code(),
                    error = %error,
                    "message dropped"
                );
                return Ok(());
            }
            outcome => {
                tracing::info!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    message_id = message.id,
                    event = event_name,
                    reason_code = outcome.reason_code(),
                    "inbound message handled"
                );
            }
        }
        let now = Utc::now();
        if planned.outcome == TransitionOutcome::Ignored {
            self.sessions.update(&key, |session| session.touch(now));
        }
        let result = self
            .executor
            .execute(&key, planned.effects, now)
            .await
            .into_result();
        if !self.sessions.contains(&key) {
            self.router.forget(&key);
        }
        result
    }
}
