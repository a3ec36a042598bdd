use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{StateError, StatusTransitionError};

/// Identifies one contact inside one tenant; sessions and queues are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactKey {
    pub tenant_id: String,
    pub contact_id: String,
}

impl ContactKey {
    pub fn new(tenant_id: impl Into<String>, contact_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            contact_id: contact_id.into(),
        }
    }
}

impl fmt::Display for ContactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.contact_id)
    }
}

/// Lifecycle state for an interview conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InterviewStatus {
    #[default]
    NotStarted,
    AwaitingResponse {
        question_index: usize,
    },
    Completed,
    Cancelled,
    TimedOut,
}

impl InterviewStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::AwaitingResponse { .. } => "awaiting_response",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Returns true when no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::TimedOut)
    }

    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::NotStarted, Self::AwaitingResponse { question_index }) => question_index == 0,
            (
                Self::AwaitingResponse { question_index: from },
                Self::AwaitingResponse { question_index: to },
            ) => to == from + 1,
            (Self::AwaitingResponse { .. }, Self::Completed) => true,
            (current, Self::Cancelled | Self::TimedOut) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError::Invalid {
            from: self.to_string(),
            to: next.to_string(),
        })
    }
}

impl fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingResponse { question_index } => {
                write!(f, "awaiting_response({question_index})")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewQuestion {
    pub text: String,
    #[serde(default)]
    pub ideal_answer: Option<String>,
}

/// A tenant's currently active job interview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewDefinition {
    pub interview_id: String,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub questions: Vec<InterviewQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub candidate_id: String,
    pub contact_id: String,
    #[serde(default)]
    pub name: String,
}

/// Candidate plus interview resolved for an opt-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterviewAssignment {
    pub candidate: CandidateProfile,
    pub interview: InterviewDefinition,
}

/// One answer captured for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub question_index: usize,
    pub text: String,
    /// True when `text` is a placeholder because transcription did not succeed.
    #[serde(default)]
    pub pending_transcription: bool,
    #[serde(default)]
    pub audio_ref: Option<String>,
    #[serde(default)]
    pub score: Option<u8>,
    pub recorded_at: DateTime<Utc>,
}

/// Live interview state for one contact.
///
/// Index and status are private so the `0 <= index <= questions.len()` and
/// `Completed iff index == questions.len()` invariants hold for every caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub key: ContactKey,
    pub candidate: CandidateProfile,
    pub interview_id: String,
    pub questions: Vec<InterviewQuestion>,
    current_question_index: usize,
    responses: Vec<RecordedResponse>,
    status: InterviewStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub record_id: Option<String>,
}

impl Session {
    /// Opens a session at question 0.
    pub fn open(
        key: ContactKey,
        assignment: InterviewAssignment,
        now: DateTime<Utc>,
    ) -> Result<Self, StateError> {
        if assignment.interview.questions.is_empty() {
            return Err(StateError::EmptyInterview);
        }
        let status = InterviewStatus::AwaitingResponse { question_index: 0 };
        InterviewStatus::NotStarted.ensure_transition(status)?;
        Ok(Self {
            key,
            candidate: assignment.candidate,
            interview_id: assignment.interview.interview_id,
            questions: assignment.interview.questions,
            current_question_index: 0,
            responses: Vec::new(),
            status,
            created_at: now,
            last_activity_at: now,
            record_id: None,
        })
    }

    pub fn status(&self) -> InterviewStatus {
        self.status
    }

    pub fn current_question_index(&self) -> usize {
        self.current_question_index
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn responses(&self) -> &[RecordedResponse] {
        &self.responses
    }

    /// Returns the question the session is waiting on, if any.
    pub fn current_question(&self) -> Option<&InterviewQuestion> {
        match self.status {
            InterviewStatus::AwaitingResponse { question_index } => {
                self.questions.get(question_index)
            }
            _ => None,
        }
    }

    /// Appends `response` and advances the index; completes on the last question.
    pub fn record_response(
        &mut self,
        response: RecordedResponse,
        now: DateTime<Utc>,
    ) -> Result<InterviewStatus, StateError> {
        let InterviewStatus::AwaitingResponse { question_index } = self.status else {
            return Err(StateError::Terminal {
                status: self.status,
            });
        };
        if response.question_index != question_index {
            return Err(StateError::QuestionMismatch {
                expected: question_index,
                received: response.question_index,
            });
        }

        let next_index = question_index + 1;
        let next_status = if next_index == self.questions.len() {
            InterviewStatus::Completed
        } else {
            InterviewStatus::AwaitingResponse {
                question_index: next_index,
            }
        };
        self.status.ensure_transition(next_status)?;

        self.responses.push(response);
        self.current_question_index = next_index;
        self.status = next_status;
        self.last_activity_at = now;
        Ok(next_status)
    }

    /// Moves a live session to `Cancelled` or `TimedOut`.
    pub fn close(&mut self, status: InterviewStatus) -> Result<(), StateError> {
        if !matches!(
            status,
            InterviewStatus::Cancelled | InterviewStatus::TimedOut
        ) {
            return Err(StatusTransitionError::Invalid {
                from: self.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }
        if self.status.is_terminal() {
            return Err(StateError::Terminal {
                status: self.status,
            });
        }
        self.status.ensure_transition(status)?;
        self.status = status;
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }

    /// True when `now - last_activity > threshold`.
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.idle_for(now) > threshold
    }

    /// Read-only projection for status listings.
    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            tenant_id: self.key.tenant_id.clone(),
            contact_id: self.key.contact_id.clone(),
            candidate_name: self.candidate.name.clone(),
            interview_id: self.interview_id.clone(),
            step: (self.current_question_index + 1).min(self.questions.len()),
            total_steps: self.questions.len(),
            status: self.status.as_str().to_string(),
            idle_seconds: self.idle_for(now).as_secs(),
            record_id: self.record_id.clone(),
        }
    }
}

/// Flat, read-only view of a session for legacy status consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub tenant_id: String,
    pub contact_id: String,
    pub candidate_name: String,
    pub interview_id: String,
    pub step: usize,
    pub total_steps: usize,
    pub status: String,
    pub idle_seconds: u64,
    pub record_id: Option<String>,
}
