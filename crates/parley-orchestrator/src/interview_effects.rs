//! Effect executor for the pure interview transitions.
//!
//! Effects run in the order the transition emitted them. A recorded response
//! is appended to the record store before the session index advances and
//! before the next question goes out. Persistence failures are logged and never
//! roll back in-memory state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_connectors::{
    DeliveryReceipt, InterviewRecordDraft, InterviewRecordStore, OutboundAudio, ScoringError,
    ScoringProvider, ScoringRequest, TtsProvider, TtsRequest,
};
use parley_types::{
    ContactKey, InterviewQuestion, InterviewStatus, OrchestratorError, RecordedResponse, Session,
    StateError, TransportError,
};

use crate::cadence::{CadenceController, ImmediateDelivery};
use crate::interview_machine::InterviewEffect;
use crate::outbound::OutboundRouter;
use crate::session_registry::SessionRegistry;

const EFFECT_REASON_TTS_FAILED: &str = "question_audio_synthesis_failed";
const EFFECT_REASON_AUDIO_SEND_FAILED: &str = "question_audio_send_failed";
const EFFECT_REASON_SCORING_FAILED: &str = "response_scoring_failed";
const EFFECT_REASON_IMMEDIATE_FALLBACK: &str = "immediate_cadence_unavailable";
const EFFECT_REASON_IMMEDIATE_DROPPED: &str = "immediate_cadence_dropped";
const EFFECT_REASON_EFFECT_FAILED: &str = "interview_effect_failed";

/// Sends one question as text, followed by synthesised audio when a speech
/// provider is configured.
pub struct QuestionSender {
    router: Arc<OutboundRouter>,
    tts: Option<Arc<dyn TtsProvider>>,
}

impl QuestionSender {
    pub fn new(router: Arc<OutboundRouter>, tts: Option<Arc<dyn TtsProvider>>) -> Self {
        Self { router, tts }
    }

    /// Only the text send decides the result; audio problems are logged.
    pub async fn send_question(
        &self,
        key: &ContactKey,
        question: &InterviewQuestion,
        preferred_slot: Option<u32>,
    ) -> Result<DeliveryReceipt, TransportError> {
        let receipt = self
            .router
            .send_text(
                &key.tenant_id,
                &key.contact_id,
                &question.text,
                preferred_slot,
            )
            .await?;
        let Some(tts) = &self.tts else {
            return Ok(receipt);
        };
        match tts.synthesize(TtsRequest::new(question.text.as_str())).await {
            Ok(synthesized) => {
                let audio = OutboundAudio {
                    bytes: synthesized.audio_bytes,
                    mime_type: synthesized.mime_type,
                };
                if let Err(error) = self
                    .router
                    .send_audio(
                        &key.tenant_id,
                        &key.contact_id,
                        &audio,
                        Some(receipt.slot_number),
                    )
                    .await
                {
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        reason_code = EFFECT_REASON_AUDIO_SEND_FAILED,
                        error = %error,
                        "question audio was not delivered"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    provider = tts.provider_name(),
                    reason_code = EFFECT_REASON_TTS_FAILED,
                    error = %error,
                    "question audio synthesis failed"
                );
            }
        }
        Ok(receipt)
    }
}

/// What happened while running one transition's effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectReport {
    pub applied: usize,
    pub errors: Vec<OrchestratorError>,
}

impl EffectReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// First failure, if any, for the queue boundary to count.
    pub fn into_result(self) -> Result<(), OrchestratorError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct EffectScratch {
    record_id: Option<String>,
    pending_response: Option<RecordedResponse>,
}

pub struct InterviewEffectExecutor {
    sessions: Arc<SessionRegistry>,
    records: Arc<dyn InterviewRecordStore>,
    router: Arc<OutboundRouter>,
    cadence: CadenceController,
    questions: Arc<QuestionSender>,
    scorer: Option<Arc<dyn ScoringProvider>>,
}

impl InterviewEffectExecutor {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        records: Arc<dyn InterviewRecordStore>,
        router: Arc<OutboundRouter>,
        cadence: CadenceController,
        questions: Arc<QuestionSender>,
        scorer: Option<Arc<dyn ScoringProvider>>,
    ) -> Self {
        Self {
            sessions,
            records,
            router,
            cadence,
            questions,
            scorer,
        }
    }

    /// Runs `effects` for `key`. A state error stops the remaining effects;
    /// transport and persistence failures are recorded and execution goes on.
    pub async fn execute(
        &self,
        key: &ContactKey,
        effects: Vec<InterviewEffect>,
        now: DateTime<Utc>,
    ) -> EffectReport {
        let mut scratch = EffectScratch {
            record_id: self.sessions.get(key).and_then(|session| session.record_id),
            pending_response: None,
        };
        let mut report = EffectReport::default();
        for effect in effects {
            let effect_name = effect_name(&effect);
            match self.apply(key, effect, now, &mut scratch).await {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        effect = effect_name,
                        reason_code = EFFECT_REASON_EFFECT_FAILED,
                        error_code = error.reason_code(),
                        error = %error,
                        "interview effect failed"
                    );
                    let stop = matches!(error, OrchestratorError::State(_));
                    report.errors.push(error);
                    if stop {
                        break;
                    }
                }
            }
        }
        report
    }

    async fn apply(
        &self,
        key: &ContactKey,
        effect: InterviewEffect,
        now: DateTime<Utc>,
        scratch: &mut EffectScratch,
    ) -> Result<(), OrchestratorError> {
        match effect {
            InterviewEffect::OpenSession { assignment } => {
                let mut session = Session::open(key.clone(), assignment, now)?;
                let created = self
                    .records
                    .create_interview_record(InterviewRecordDraft {
                        tenant_id: key.tenant_id.clone(),
                        contact_id: key.contact_id.clone(),
                        candidate_id: session.candidate.candidate_id.clone(),
                        interview_id: session.interview_id.clone(),
                        question_count: session.question_count(),
                        started_at: now,
                    })
                    .await;
                if let Ok(record_id) = &created {
                    session.record_id = Some(record_id.clone());
                    scratch.record_id = Some(record_id.clone());
                }
                self.sessions.insert(session)?;
                tracing::info!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    record_id = scratch.record_id.as_deref().unwrap_or("none"),
                    "interview session opened"
                );
                created
                    .map(|_| ())
                    .map_err(|error| OrchestratorError::Persistence(error.to_string()))
            }
            InterviewEffect::ActivateImmediate { question_index } => {
                let pending = match self.cadence.activate_immediate_question(
                    &key.tenant_id,
                    &key.contact_id,
                    question_index,
                ) {
                    Ok(pending) => pending,
                    Err(error) => {
                        tracing::warn!(
                            tenant_id = %key.tenant_id,
                            contact_id = %key.contact_id,
                            reason_code = EFFECT_REASON_IMMEDIATE_FALLBACK,
                            error = %error,
                            "sending first question without cadence"
                        );
                        return self.send_planned_question(key, question_index).await;
                    }
                };
                match pending.delivered().await {
                    ImmediateDelivery::Sent | ImmediateDelivery::Skipped => Ok(()),
                    ImmediateDelivery::Failed(error) => Err(error.into()),
                    ImmediateDelivery::Suspended => Err(OrchestratorError::Configuration {
                        tenant_id: key.tenant_id.clone(),
                        reason: "question queued until the tenant is resumed".to_string(),
                    }),
                    ImmediateDelivery::Dropped => {
                        tracing::warn!(
                            tenant_id = %key.tenant_id,
                            contact_id = %key.contact_id,
                            reason_code = EFFECT_REASON_IMMEDIATE_DROPPED,
                            "cadence dropped first question; sending directly"
                        );
                        self.send_planned_question(key, question_index).await
                    }
                }
            }
            InterviewEffect::PersistResponse {
                question_index,
                text,
                audio_ref,
                pending_transcription,
            } => {
                let session = self.sessions.get(key).ok_or(StateError::NoSession)?;
                let question =
                    session
                        .questions
                        .get(question_index)
                        .ok_or(StateError::QuestionMismatch {
                            expected: session.current_question_index(),
                            received: question_index,
                        })?;
                let score = if pending_transcription {
                    None
                } else {
                    self.score(key, question, &text).await
                };
                let response = RecordedResponse {
                    question_index,
                    text,
                    pending_transcription,
                    audio_ref,
                    score,
                    recorded_at: now,
                };
                scratch.pending_response = Some(response.clone());
                let record_id = scratch.record_id.as_deref().ok_or_else(|| {
                    OrchestratorError::Persistence("session has no interview record".to_string())
                })?;
                self.records
                    .append_response(record_id, &response)
                    .await
                    .map_err(|error| OrchestratorError::Persistence(error.to_string()))
            }
            InterviewEffect::AdvanceQuestion => {
                let response = scratch
                    .pending_response
                    .take()
                    .ok_or(StateError::NoSession)?;
                let status = self
                    .sessions
                    .update(key, |session| session.record_response(response, now))
                    .ok_or(StateError::NoSession)??;
                tracing::debug!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    status = %status,
                    "interview advanced"
                );
                Ok(())
            }
            InterviewEffect::SendText { text } => {
                self.router
                    .send_text(&key.tenant_id, &key.contact_id, &text, None)
                    .await?;
                Ok(())
            }
            InterviewEffect::SendQuestion {
                question_index,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.send_planned_question(key, question_index).await
            }
            InterviewEffect::PersistStatus { status } => {
                let record_id = scratch.record_id.as_deref().ok_or_else(|| {
                    OrchestratorError::Persistence("session has no interview record".to_string())
                })?;
                self.records
                    .update_interview_status(record_id, status)
                    .await
                    .map_err(|error| OrchestratorError::Persistence(error.to_string()))
            }
            InterviewEffect::CloseSession { status } => {
                self.router.forget(key);
                if status == InterviewStatus::Completed {
                    self.sessions.remove(key);
                    return Ok(());
                }
                self.sessions.close(key, status)?;
                Ok(())
            }
        }
    }

    /// Sends `question_index` if the session is still on it.
    async fn send_planned_question(
        &self,
        key: &ContactKey,
        question_index: usize,
    ) -> Result<(), OrchestratorError> {
        let session = self.sessions.get(key).ok_or(StateError::NoSession)?;
        if session.current_question_index() != question_index {
            return Err(StateError::QuestionMismatch {
                expected: session.current_question_index(),
                received: question_index,
            }
            .into());
        }
        let question = session
            .current_question()
            .ok_or(StateError::Terminal {
                status: session.status(),
            })?;
        self.questions.send_question(key, question, None).await?;
        Ok(())
    }

    async fn score(
        &self,
        key: &ContactKey,
        question: &InterviewQuestion,
        response: &str,
    ) -> Option<u8> {
        let scorer = self.scorer.as_ref()?;
        let request = ScoringRequest {
            question: question.text.clone(),
            response: response.to_string(),
            ideal_answer: question.ideal_answer.clone(),
        };
        match scorer.evaluate(request).await {
            Ok(score) => Some(score.min(100)),
            Err(ScoringError::MissingIdealAnswer) => None,
            Err(error) => {
                tracing::warn!(
                    tenant_id = %key.tenant_id,
                    contact_id = %key.contact_id,
                    provider = scorer.provider_name(),
                    reason_code = EFFECT_REASON_SCORING_FAILED,
                    error = %error,
                    "response stored without score"
                );
                None
            }
        }
    }
}

fn effect_name(effect: &InterviewEffect) -> &'static str {
    match effect {
        InterviewEffect::OpenSession { .. } => "open_session",
        InterviewEffect::ActivateImmediate { .. } => "activate_immediate",
        InterviewEffect::PersistResponse { .. } => "persist_response",
        InterviewEffect::AdvanceQuestion => "advance_question",
        InterviewEffect::SendText { .. } => "send_text",
        InterviewEffect::SendQuestion { .. } => "send_question",
        InterviewEffect::PersistStatus { .. } => "persist_status",
        InterviewEffect::CloseSession { .. } => "close_session",
    }
}
