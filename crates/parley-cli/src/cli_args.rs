use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use parley_orchestrator::OrchestratorConfig;
use parley_types::DistributionPriority;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOutboundMode {
    DryRun,
    Provider,
}

impl CliOutboundMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliInvitePriority {
    Normal,
    Urgent,
    Immediate,
}

impl From<CliInvitePriority> for DistributionPriority {
    fn from(value: CliInvitePriority) -> Self {
        match value {
            CliInvitePriority::Normal => DistributionPriority::Normal,
            CliInvitePriority::Urgent => DistributionPriority::Urgent,
            CliInvitePriority::Immediate => DistributionPriority::Immediate,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Replays inbound interview traffic through the Parley orchestration engine",
    version
)]
/// Public struct `Cli` holding every operator flag of the replay binary.
pub struct Cli {
    #[arg(
        long,
        env = "PARLEY_ROSTER",
        help = "Tenant roster JSON: slots, gateway tokens, candidates, active interview and invitation lists."
    )]
    pub roster: PathBuf,

    #[arg(
        long,
        env = "PARLEY_INBOUND",
        help = "NDJSON file of inbound events, one {contact_id, tenant_id?, text?, audio_ref?} object per line."
    )]
    pub inbound: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "PARLEY_STATE_DIR",
        default_value = ".parley",
        help = "Directory receiving monitor-snapshot.json, interview-records.json and the dry-run outbound log."
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "outbound-mode",
        env = "PARLEY_OUTBOUND_MODE",
        value_enum,
        default_value_t = CliOutboundMode::DryRun,
        help = "dry-run records outbound messages locally; provider posts them to the messaging gateway."
    )]
    pub outbound_mode: CliOutboundMode,

    #[arg(
        long = "gateway-api-base",
        env = "PARLEY_GATEWAY_API_BASE",
        default_value = "http://127.0.0.1:8787",
        help = "Messaging gateway base URL used in provider mode."
    )]
    pub gateway_api_base: String,

    #[arg(
        long = "gateway-timeout-ms",
        env = "PARLEY_GATEWAY_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "HTTP timeout for one gateway request."
    )]
    pub gateway_timeout_ms: u64,

    #[arg(
        long = "session-idle-timeout-secs",
        env = "PARLEY_SESSION_IDLE_TIMEOUT_SECS",
        value_parser = parse_positive_u64,
        help = "Override the idle threshold after which sessions are timed out (default 3600)."
    )]
    pub session_idle_timeout_secs: Option<u64>,

    #[arg(
        long = "monitor-interval-ms",
        env = "PARLEY_MONITOR_INTERVAL_MS",
        value_parser = parse_positive_u64,
        help = "Override the session monitor sweep interval."
    )]
    pub monitor_interval_ms: Option<u64>,

    #[arg(
        long = "queue-depth-warn-threshold",
        env = "PARLEY_QUEUE_DEPTH_WARN_THRESHOLD",
        value_parser = parse_positive_usize,
        help = "Queue depth above which a contact is reported as deep."
    )]
    pub queue_depth_warn_threshold: Option<usize>,

    #[arg(
        long = "question-delay-ms",
        env = "PARLEY_QUESTION_DELAY_MS",
        help = "Override the pause before the next question is sent."
    )]
    pub question_delay_ms: Option<u64>,

    #[arg(
        long = "batch-delay-ms",
        env = "PARLEY_BATCH_DELAY_MS",
        help = "Override the per-slot delay between normal-priority invitations."
    )]
    pub batch_delay_ms: Option<u64>,

    #[arg(
        long = "urgent-delay-ms",
        env = "PARLEY_URGENT_DELAY_MS",
        help = "Override the per-slot delay between urgent invitations."
    )]
    pub urgent_delay_ms: Option<u64>,

    #[arg(
        long = "immediate-delay-ms",
        env = "PARLEY_IMMEDIATE_DELAY_MS",
        help = "Override the per-slot delay for immediate sends."
    )]
    pub immediate_delay_ms: Option<u64>,

    #[arg(
        long = "adaptive-pacing",
        env = "PARLEY_ADAPTIVE_PACING",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Stretch pacing after rate-limit failures and relax it after successful sends."
    )]
    pub adaptive_pacing: bool,

    #[arg(
        long = "invite",
        env = "PARLEY_INVITE",
        value_delimiter = ',',
        help = "Tenant ids whose roster invitation list is sent as a cadence batch before replay."
    )]
    pub invite: Vec<String>,

    #[arg(
        long = "invite-priority",
        env = "PARLEY_INVITE_PRIORITY",
        value_enum,
        default_value_t = CliInvitePriority::Normal,
        help = "Distribution priority for --invite batches."
    )]
    pub invite_priority: CliInvitePriority,

    #[arg(
        long = "synthesize-questions",
        env = "PARLEY_SYNTHESIZE_QUESTIONS",
        default_value_t = false,
        action = ArgAction::Set,
        help = "Follow every question text with synthesised audio."
    )]
    pub synthesize_questions: bool,

    #[arg(
        long = "idle-wait-timeout-ms",
        env = "PARLEY_IDLE_WAIT_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        help = "Upper bound on waiting for queues and cadence batches to drain after replay."
    )]
    pub idle_wait_timeout_ms: u64,
}

impl Cli {
    /// Builds the engine configuration with per-run overrides applied.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig::default();
        if let Some(secs) = self.session_idle_timeout_secs {
            config.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.monitor_interval_ms {
            config.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.queue_depth_warn_threshold {
            config.queue_depth_warn_threshold = threshold;
        }
        if let Some(ms) = self.question_delay_ms {
            config.question_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.batch_delay_ms {
            config.pacing.batch_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.urgent_delay_ms {
            config.pacing.urgent_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.immediate_delay_ms {
            config.pacing.immediate_delay = Duration::from_millis(ms);
        }
        config.pacing.adaptive_pacing = self.adaptive_pacing;
        config.validate()?;
        Ok(config)
    }

    pub fn idle_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_wait_timeout_ms)
    }
}
