use std::time::Duration;

use anyhow::{bail, Result};
use parley_types::{CadenceMode, DistributionPriority};

const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_QUEUE_DEPTH_WARN_THRESHOLD: usize = 5;
const DEFAULT_LATENCY_WINDOW: usize = 128;
const DEFAULT_QUESTION_DELAY: Duration = Duration::from_millis(1_500);
const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_URGENT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_IMMEDIATE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_ADAPTIVE_MAX_MULTIPLIER: u32 = 8;
const DEFAULT_CADENCE_RETRY_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `PacingConfig` used across cadence and distributor components.
pub struct PacingConfig {
    pub batch_delay: Duration,
    pub urgent_delay: Duration,
    pub immediate_delay: Duration,
    pub adaptive_pacing: bool,
    pub adaptive_max_multiplier: u32,
}

impl PacingConfig {
    /// Base delay between two sends of the same slot for `priority`.
    pub fn delay_for_priority(&self, priority: DistributionPriority) -> Duration {
        match priority {
            DistributionPriority::Normal => self.batch_delay,
            DistributionPriority::Urgent => self.urgent_delay,
            DistributionPriority::Immediate => self.immediate_delay,
        }
    }

    pub fn delay_for_mode(&self, mode: CadenceMode, batch_delay: Duration) -> Duration {
        match mode {
            CadenceMode::Batch => batch_delay,
            CadenceMode::Immediate => self.immediate_delay,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            batch_delay: DEFAULT_BATCH_DELAY,
            urgent_delay: DEFAULT_URGENT_DELAY,
            immediate_delay: DEFAULT_IMMEDIATE_DELAY,
            adaptive_pacing: true,
            adaptive_max_multiplier: DEFAULT_ADAPTIVE_MAX_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Generic user-visible replies. Internal causes are never sent to contacts.
pub struct ReplyTexts {
    pub menu_prompt: String,
    pub invitation_text: String,
    pub closing_text: String,
    pub opt_out_ack_text: String,
    pub start_failed_text: String,
    pub transcription_placeholder: String,
}

impl Default for ReplyTexts {
    fn default() -> Self {
        Self {
            menu_prompt: "Reply 1 to start your interview or 2 to decline.".to_string(),
            invitation_text:
                "You have been invited to a short interview. Reply 1 to start or 2 to decline."
                    .to_string(),
            closing_text: "Thank you! Your interview is complete. We will be in touch.".to_string(),
            opt_out_ack_text: "Understood. You will not receive further interview messages."
                .to_string(),
            start_failed_text: "We could not start your interview right now. Please try again later."
                .to_string(),
            transcription_placeholder: "[audio response pending transcription]".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `OrchestratorConfig` used across Parley orchestration components.
pub struct OrchestratorConfig {
    pub session_idle_timeout: Duration,
    pub monitor_interval: Duration,
    pub queue_depth_warn_threshold: usize,
    pub latency_window: usize,
    pub question_delay: Duration,
    pub pacing: PacingConfig,
    pub cadence_retry_max_attempts: u32,
    pub replies: ReplyTexts,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            queue_depth_warn_threshold: DEFAULT_QUEUE_DEPTH_WARN_THRESHOLD,
            latency_window: DEFAULT_LATENCY_WINDOW,
            question_delay: DEFAULT_QUESTION_DELAY,
            pacing: PacingConfig::default(),
            cadence_retry_max_attempts: DEFAULT_CADENCE_RETRY_MAX_ATTEMPTS,
            replies: ReplyTexts::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_idle_timeout.is_zero() {
            bail!("session idle timeout must be greater than zero");
        }
        if self.monitor_interval.is_zero() {
            bail!("session monitor interval must be greater than zero");
        }
        if self.queue_depth_warn_threshold == 0 {
            bail!("queue depth warn threshold must be greater than zero");
        }
        if self.latency_window == 0 {
            bail!("latency window must hold at least one sample");
        }
        if self.pacing.adaptive_max_multiplier == 0 {
            bail!("adaptive max multiplier must be at least 1");
        }
        for (name, text) in [
            ("menu_prompt", &self.replies.menu_prompt),
            ("invitation_text", &self.replies.invitation_text),
            ("closing_text", &self.replies.closing_text),
            ("opt_out_ack_text", &self.replies.opt_out_ack_text),
            ("start_failed_text", &self.replies.start_failed_text),
            (
                "transcription_placeholder",
                &self.replies.transcription_placeholder,
            ),
        ] {
            if text.trim().is_empty() {
                bail!("reply text '{name}' must not be empty");
            }
        }
        Ok(())
    }
}
