//! Pure interview transitions.
//!
//! [`transition`] takes the current session (if any) and one event and returns
//! the ordered effects to run. It performs no I/O; the effect executor owns
//! sends, persistence and registry mutation.

use std::time::Duration;

use parley_types::{InterviewAssignment, InterviewStatus, Session, StateError};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `InterviewEvent` values.
pub enum InterviewEvent {
    /// Opt-in keyword; `assignment` is `None` when no candidate or active
    /// interview could be resolved.
    OptIn {
        assignment: Option<InterviewAssignment>,
    },
    OptOut,
    Stop,
    Response {
        text: String,
        audio_ref: Option<String>,
        pending_transcription: bool,
    },
    /// Any other message, including empty ones.
    Unrecognized,
    IdleTimeout,
}

impl InterviewEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn { .. } => "opt_in",
            Self::OptOut => "opt_out",
            Self::Stop => "stop",
            Self::Response { .. } => "response",
            Self::Unrecognized => "unrecognized",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `InterviewEffect` values.
pub enum InterviewEffect {
    OpenSession {
        assignment: InterviewAssignment,
    },
    /// Deliver `question_index` through the tenant's immediate cadence before
    /// the contact's next message is processed.
    ActivateImmediate { question_index: usize },
    PersistResponse {
        question_index: usize,
        text: String,
        audio_ref: Option<String>,
        pending_transcription: bool,
    },
    /// Apply the response persisted by the preceding `PersistResponse`.
    AdvanceQuestion,
    SendText {
        text: String,
    },
    SendQuestion {
        question_index: usize,
        delay: Duration,
    },
    PersistStatus {
        status: InterviewStatus,
    },
    CloseSession {
        status: InterviewStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `TransitionOutcome` values.
pub enum TransitionOutcome {
    Started,
    Advanced { question_index: usize },
    Completed,
    Cancelled,
    TimedOut,
    Acknowledged,
    MenuPrompted,
    /// Contact belongs to an active batch; stay silent.
    Suppressed,
    StartFailed,
    Ignored,
    Dropped(StateError),
}

impl TransitionOutcome {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Started => "interview_started",
            Self::Advanced { .. } => "interview_advanced",
            Self::Completed => "interview_completed",
            Self::Cancelled => "interview_cancelled",
            Self::TimedOut => "interview_timed_out",
            Self::Acknowledged => "opt_out_acknowledged",
            Self::MenuPrompted => "menu_prompted",
            Self::Suppressed => "menu_suppressed_active_batch",
            Self::StartFailed => "interview_start_failed",
            Self::Ignored => "message_ignored",
            Self::Dropped(_) => "state_error_dropped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `InterviewTransition` returned by [`transition`].
pub struct InterviewTransition {
    pub effects: Vec<InterviewEffect>,
    pub outcome: TransitionOutcome,
}

impl InterviewTransition {
    fn new(outcome: TransitionOutcome, effects: Vec<InterviewEffect>) -> Self {
        Self { effects, outcome }
    }

    fn none(outcome: TransitionOutcome) -> Self {
        Self::new(outcome, Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
/// Inputs the transition needs besides the session itself.
pub struct TransitionContext<'a> {
    pub in_active_batch: bool,
    pub question_delay: Duration,
    pub menu_prompt: &'a str,
    pub closing_text: &'a str,
    pub opt_out_ack_text: &'a str,
    pub start_failed_text: &'a str,
}

pub fn transition(
    session: Option<&Session>,
    event: InterviewEvent,
    ctx: &TransitionContext<'_>,
) -> InterviewTransition {
    match session {
        None => transition_without_session(event, ctx),
        Some(session) => transition_with_session(session, event, ctx),
    }
}

fn transition_without_session(
    event: InterviewEvent,
    ctx: &TransitionContext<'_>,
) -> InterviewTransition {
    match event {
        InterviewEvent::OptIn {
            assignment: Some(assignment),
        } if !assignment.interview.questions.is_empty() => InterviewTransition::new(
            TransitionOutcome::Started,
            vec![
                InterviewEffect::OpenSession { assignment },
                InterviewEffect::ActivateImmediate { question_index: 0 },
            ],
        ),
        InterviewEvent::OptIn { .. } => InterviewTransition::new(
            TransitionOutcome::StartFailed,
            vec![send_text(ctx.start_failed_text)],
        ),
        InterviewEvent::OptOut | InterviewEvent::Stop => InterviewTransition::new(
            TransitionOutcome::Acknowledged,
            vec![send_text(ctx.opt_out_ack_text)],
        ),
        InterviewEvent::Response { .. } | InterviewEvent::Unrecognized => {
            if ctx.in_active_batch {
                InterviewTransition::none(TransitionOutcome::Suppressed)
            } else {
                InterviewTransition::new(
                    TransitionOutcome::MenuPrompted,
                    vec![send_text(ctx.menu_prompt)],
                )
            }
        }
        InterviewEvent::IdleTimeout => {
            InterviewTransition::none(TransitionOutcome::Dropped(StateError::NoSession))
        }
    }
}

fn transition_with_session(
    session: &Session,
    event: InterviewEvent,
    ctx: &TransitionContext<'_>,
) -> InterviewTransition {
    let status = session.status();
    let InterviewStatus::AwaitingResponse { question_index } = status else {
        return InterviewTransition::none(TransitionOutcome::Dropped(StateError::Terminal {
            status,
        }));
    };

    match event {
        InterviewEvent::OptOut | InterviewEvent::Stop => InterviewTransition::new(
            TransitionOutcome::Cancelled,
            vec![
                InterviewEffect::CloseSession {
                    status: InterviewStatus::Cancelled,
                },
                InterviewEffect::PersistStatus {
                    status: InterviewStatus::Cancelled,
                },
                send_text(ctx.opt_out_ack_text),
            ],
        ),
        InterviewEvent::IdleTimeout => InterviewTransition::new(
            TransitionOutcome::TimedOut,
            vec![
                InterviewEffect::CloseSession {
                    status: InterviewStatus::TimedOut,
                },
                InterviewEffect::PersistStatus {
                    status: InterviewStatus::TimedOut,
                },
            ],
        ),
        InterviewEvent::Response {
            text,
            audio_ref,
            pending_transcription,
        } => {
            let next_index = question_index + 1;
            let mut effects = vec![
                InterviewEffect::PersistResponse {
                    question_index,
                    text,
                    audio_ref,
                    pending_transcription,
                },
                InterviewEffect::AdvanceQuestion,
            ];
            if next_index >= session.question_count() {
                effects.push(InterviewEffect::PersistStatus {
                    status: InterviewStatus::Completed,
                });
                effects.push(send_text(ctx.closing_text));
                effects.push(InterviewEffect::CloseSession {
                    status: InterviewStatus::Completed,
                });
                InterviewTransition::new(TransitionOutcome::Completed, effects)
            } else {
                effects.push(InterviewEffect::SendQuestion {
                    question_index: next_index,
                    delay: ctx.question_delay,
                });
                InterviewTransition::new(
                    TransitionOutcome::Advanced {
                        question_index: next_index,
                    },
                    effects,
                )
            }
        }
        InterviewEvent::OptIn { .. } | InterviewEvent::Unrecognized => {
            InterviewTransition::none(TransitionOutcome::Ignored)
        }
    }
}

fn send_text(text: &str) -> InterviewEffect {
    InterviewEffect::SendText {
        text: text.to_string(),
    }
}
