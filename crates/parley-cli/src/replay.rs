//! Inbound NDJSON replay through a fully wired interview engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parley_connectors::{
    parse_inbound_envelope, DeterministicVoiceProvider, HttpMessagingGateway,
    HttpMessagingGatewayConfig, InMemoryAudioStore, InMemoryCandidateDirectory,
    InMemoryInterviewRecordStore, KeywordOverlapScorer, MessagingTransport, RecordingTransport,
};
use parley_core::write_json_atomic;
use parley_orchestrator::{
    start_session_monitor, EngineCollaborators, InboundOutcome, InterviewEngine, SessionMonitor,
    SessionMonitorOptions,
};
use parley_types::DistributionPriority;
use serde::Serialize;

use crate::bootstrap_helpers::{
    ensure_state_dir, state_file, INTERVIEW_RECORDS_FILE_NAME, MONITOR_SNAPSHOT_FILE_NAME,
    OUTBOUND_LOG_FILE_NAME,
};
use crate::cli_args::{Cli, CliOutboundMode};
use crate::roster::{
    connect_roster_slots, load_roster, seed_audio_store, seed_directory, RosterFile,
};

const REPLAY_REASON_NOT_DRAINED: &str = "replay_idle_wait_timed_out";
const REPLAY_REASON_INVITATION_FAILED: &str = "invitation_batch_failed";

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct InvitationSummary {
    pub(crate) tenant_id: String,
    pub(crate) contacts: usize,
    pub(crate) slots: usize,
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
/// Counters printed as JSON after a replay run.
pub(crate) struct ReplaySummary {
    pub(crate) outbound_mode: &'static str,
    pub(crate) slots_connected: usize,
    pub(crate) invitations: Vec<InvitationSummary>,
    pub(crate) inbound_lines: usize,
    pub(crate) queued: usize,
    pub(crate) dropped: usize,
    pub(crate) invalid: usize,
    pub(crate) reason_code_counts: BTreeMap<String, usize>,
    pub(crate) drained: bool,
    pub(crate) active_sessions: usize,
    pub(crate) records_written: usize,
    pub(crate) outbound_messages: Option<usize>,
    pub(crate) snapshot_path: String,
    pub(crate) records_path: String,
}

impl ReplaySummary {
    fn count_reason(&mut self, reason_code: &str) {
        *self
            .reason_code_counts
            .entry(reason_code.to_string())
            .or_insert(0) += 1;
    }
}

struct ReplayRuntime {
    engine: InterviewEngine,
    records: Arc<InMemoryInterviewRecordStore>,
    recording: Option<Arc<RecordingTransport>>,
}

async fn build_runtime(cli: &Cli, roster: &RosterFile) -> Result<ReplayRuntime> {
    let config = cli.orchestrator_config()?;
    let mut recording = None;
    let transport: Arc<dyn MessagingTransport> = match cli.outbound_mode {
        CliOutboundMode::DryRun => {
            let recorder = Arc::new(RecordingTransport::new());
            recording = Some(recorder.clone());
            recorder
        }
        CliOutboundMode::Provider => Arc::new(
            HttpMessagingGateway::new(HttpMessagingGatewayConfig {
                api_base: cli.gateway_api_base.clone(),
                http_timeout_ms: cli.gateway_timeout_ms,
                tenant_tokens: roster.gateway_tokens(),
            })
            .context("failed to build messaging gateway client")?,
        ),
    };

    let directory = Arc::new(InMemoryCandidateDirectory::new());
    seed_directory(roster, &directory).await;
    let audio_store = Arc::new(InMemoryAudioStore::new());
    seed_audio_store(roster, &audio_store).await;
    let records = Arc::new(InMemoryInterviewRecordStore::new());

    let mut collaborators = EngineCollaborators::new(transport, directory, records.clone())
        .with_stt(Arc::new(DeterministicVoiceProvider))
        .with_audio_store(audio_store)
        .with_scorer(Arc::new(KeywordOverlapScorer));
    if cli.synthesize_questions {
        collaborators = collaborators.with_tts(Arc::new(DeterministicVoiceProvider));
    }
    let engine = InterviewEngine::new(config, collaborators)?;
    Ok(ReplayRuntime {
        engine,
        records,
        recording,
    })
}

fn start_invitations(
    cli: &Cli,
    roster: &RosterFile,
    engine: &InterviewEngine,
) -> Result<Vec<InvitationSummary>> {
    let priority = DistributionPriority::from(cli.invite_priority);
    let mut summaries = Vec::new();
    for tenant_id in cli.invite.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        let Some(tenant) = roster.tenant(tenant_id) else {
            bail!("--invite names tenant '{tenant_id}' which is not in the roster");
        };
        let mut summary = InvitationSummary {
            tenant_id: tenant_id.to_string(),
            ..InvitationSummary::default()
        };
        match engine.start_invitations(tenant_id, &tenant.invitations, priority) {
            Ok(distributions) => {
                summary.slots = distributions.len();
                summary.contacts = distributions
                    .iter()
                    .map(|distribution| distribution.contacts.len())
                    .sum();
            }
            Err(error) => {
                tracing::warn!(
                    tenant_id,
                    reason_code = REPLAY_REASON_INVITATION_FAILED,
                    error = %error,
                    "invitation batch not started"
                );
                summary.error = Some(error.to_string());
            }
        }
        summaries.push(summary);
    }
    Ok(summaries)
}

async fn replay_inbound_file(
    path: &Path,
    engine: &InterviewEngine,
    summary: &mut ReplaySummary,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inbound log {}", path.display()))?;
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        summary.inbound_lines = summary.inbound_lines.saturating_add(1);
        let event = match parse_inbound_envelope(line) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(
                    line = index.saturating_add(1),
                    reason_code = error.reason_code(),
                    error = %error,
                    "inbound line skipped"
                );
                summary.invalid = summary.invalid.saturating_add(1);
                summary.count_reason(error.reason_code());
                continue;
            }
        };
        match engine.handle_inbound(event).await {
            InboundOutcome::Queued { .. } => {
                summary.queued = summary.queued.saturating_add(1);
            }
            InboundOutcome::Dropped { reason_code } => {
                summary.dropped = summary.dropped.saturating_add(1);
                summary.count_reason(reason_code);
            }
        }
    }
    Ok(())
}

/// Loads the roster, replays the inbound log, waits for the engine to drain
/// and writes the monitor snapshot and interview records into the state dir.
pub(crate) async fn run_replay(cli: &Cli) -> Result<ReplaySummary> {
    let roster = load_roster(&cli.roster)?;
    ensure_state_dir(&cli.state_dir)?;
    let runtime = build_runtime(cli, &roster).await?;
    let engine = runtime.engine.clone();

    let mut summary = ReplaySummary {
        outbound_mode: cli.outbound_mode.as_str(),
        ..ReplaySummary::default()
    };
    summary.slots_connected = connect_roster_slots(&roster, &engine)?;
    summary.invitations = start_invitations(cli, &roster, &engine)?;

    let mut monitor =
        start_session_monitor(engine.clone(), SessionMonitorOptions::from_config(engine.config()))?;
    if let Some(path) = &cli.inbound {
        replay_inbound_file(path, &engine, &mut summary).await?;
    }
    summary.drained = engine.wait_until_idle(cli.idle_wait_timeout()).await;
    if !summary.drained {
        tracing::warn!(
            reason_code = REPLAY_REASON_NOT_DRAINED,
            timeout_ms = cli.idle_wait_timeout_ms,
            "engine still busy after replay"
        );
        summary.count_reason(REPLAY_REASON_NOT_DRAINED);
    }
    monitor.shutdown().await;

    let snapshot = SessionMonitor::new(engine.clone()).sweep(Utc::now()).await;
    summary.active_sessions = snapshot.active_sessions;
    let snapshot_path = state_file(&cli.state_dir, MONITOR_SNAPSHOT_FILE_NAME);
    write_json_atomic(&snapshot_path, &snapshot)
        .with_context(|| format!("failed to write {}", snapshot_path.display()))?;
    summary.snapshot_path = snapshot_path.display().to_string();

    let mut records = runtime.records.records().await;
    records.sort_by(|left, right| left.record_id.cmp(&right.record_id));
    summary.records_written = records.len();
    let records_path = state_file(&cli.state_dir, INTERVIEW_RECORDS_FILE_NAME);
    write_json_atomic(&records_path, &records)
        .with_context(|| format!("failed to write {}", records_path.display()))?;
    summary.records_path = records_path.display().to_string();

    if let Some(recording) = &runtime.recording {
        let sent = recording.sent();
        summary.outbound_messages = Some(sent.len());
        let outbound_path = state_file(&cli.state_dir, OUTBOUND_LOG_FILE_NAME);
        write_json_atomic(&outbound_path, &sent)
            .with_context(|| format!("failed to write {}", outbound_path.display()))?;
    }

    tracing::info!(
        inbound_lines = summary.inbound_lines,
        queued = summary.queued,
        dropped = summary.dropped,
        invalid = summary.invalid,
        records = summary.records_written,
        "replay finished"
    );
    Ok(summary)
}
