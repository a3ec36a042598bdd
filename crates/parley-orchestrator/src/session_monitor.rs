//! Periodic session monitor: idle eviction plus a read-only health snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parley_core::{current_unix_timestamp_ms, duration_to_ms, write_json_atomic};
use parley_types::SessionView;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::cadence::CadenceStatus;
use crate::config::OrchestratorConfig;
use crate::engine::{ExpireOutcome, InterviewEngine};

pub const MONITOR_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

const MONITOR_STATE_STARTING: &str = "starting";
const MONITOR_STATE_RUNNING: &str = "running";
const MONITOR_STATE_STOPPED: &str = "stopped";
const MONITOR_REASON_SWEEP_OK: &str = "monitor_sweep_ok";
const MONITOR_REASON_SESSIONS_EVICTED: &str = "idle_sessions_evicted";
const MONITOR_REASON_EVICTION_DEFERRED: &str = "idle_eviction_deferred_busy";
const MONITOR_REASON_DEEP_QUEUE: &str = "queue_depth_above_threshold";
const MONITOR_REASON_ISOLATION_VIOLATION: &str = "tenant_isolation_violation";
const MONITOR_REASON_SNAPSHOT_PERSIST_FAILED: &str = "monitor_snapshot_persist_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Public struct `MonitorSnapshot` published after every sweep.
pub struct MonitorSnapshot {
    pub schema_version: u32,
    pub run_state: String,
    pub tick_count: u64,
    pub updated_unix_ms: u64,
    pub active_sessions: usize,
    pub evicted_sessions: usize,
    pub deferred_evictions: usize,
    pub queue_depths: BTreeMap<String, usize>,
    pub deep_queues: Vec<String>,
    pub average_latency_ms: f64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub cadence: Vec<CadenceStatus>,
    pub isolation_violations: usize,
    pub sessions: Vec<SessionView>,
    pub reason_codes: Vec<String>,
}

impl MonitorSnapshot {
    fn empty(run_state: &str) -> Self {
        Self {
            schema_version: MONITOR_SNAPSHOT_SCHEMA_VERSION,
            run_state: run_state.to_string(),
            tick_count: 0,
            updated_unix_ms: current_unix_timestamp_ms(),
            active_sessions: 0,
            evicted_sessions: 0,
            deferred_evictions: 0,
            queue_depths: BTreeMap::new(),
            deep_queues: Vec::new(),
            average_latency_ms: 0.0,
            processed_total: 0,
            failed_total: 0,
            cadence: Vec::new(),
            isolation_violations: 0,
            sessions: Vec::new(),
            reason_codes: Vec::new(),
        }
    }
}

/// Runs sweeps against one engine and counts them.
pub struct SessionMonitor {
    engine: InterviewEngine,
    tick_count: u64,
}

impl SessionMonitor {
    pub fn new(engine: InterviewEngine) -> Self {
        Self {
            engine,
            tick_count: 0,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Evicts sessions idle beyond the threshold and aggregates metrics.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> MonitorSnapshot {
        self.tick_count = self.tick_count.saturating_add(1);
        let config = self.engine.config().clone();
        let mut reason_codes = Vec::new();

        let mut evicted_sessions = 0_usize;
        let mut deferred_evictions = 0_usize;
        for key in self
            .engine
            .sessions()
            .idle_keys(now, config.session_idle_timeout)
        {
            match self.engine.expire_session(&key, now).await {
                ExpireOutcome::Evicted => evicted_sessions += 1,
                ExpireOutcome::Busy => deferred_evictions += 1,
                ExpireOutcome::NotIdle | ExpireOutcome::Missing => {}
            }
        }
        if evicted_sessions > 0 {
            tracing::info!(
                evicted = evicted_sessions,
                reason_code = MONITOR_REASON_SESSIONS_EVICTED,
                "session monitor evicted idle sessions"
            );
            reason_codes.push(MONITOR_REASON_SESSIONS_EVICTED.to_string());
        }
        if deferred_evictions > 0 {
            reason_codes.push(MONITOR_REASON_EVICTION_DEFERRED.to_string());
        }

        let metrics = self.engine.queue().metrics();
        let deep_queues = deep_queues(&metrics.queue_depths, config.queue_depth_warn_threshold);
        for contact in &deep_queues {
            tracing::warn!(
                contact = %contact,
                depth = metrics.queue_depths.get(contact).copied().unwrap_or(0),
                threshold = config.queue_depth_warn_threshold,
                reason_code = MONITOR_REASON_DEEP_QUEUE,
                "contact queue depth above threshold"
            );
        }
        if !deep_queues.is_empty() {
            reason_codes.push(MONITOR_REASON_DEEP_QUEUE.to_string());
        }

        let violations = self.engine.slots().audit_tenant_isolation();
        for violation in &violations {
            tracing::warn!(
                identity = %violation.identity,
                tenants = ?violation.tenants,
                reason_code = MONITOR_REASON_ISOLATION_VIOLATION,
                "connection identity bound under several tenants"
            );
        }
        if !violations.is_empty() {
            reason_codes.push(MONITOR_REASON_ISOLATION_VIOLATION.to_string());
        }
        if reason_codes.is_empty() {
            reason_codes.push(MONITOR_REASON_SWEEP_OK.to_string());
        }

        let sessions = self.engine.session_views(now);
        MonitorSnapshot {
            schema_version: MONITOR_SNAPSHOT_SCHEMA_VERSION,
            run_state: MONITOR_STATE_RUNNING.to_string(),
            tick_count: self.tick_count,
            updated_unix_ms: current_unix_timestamp_ms(),
            active_sessions: sessions.len(),
            evicted_sessions,
            deferred_evictions,
            queue_depths: metrics.queue_depths,
            deep_queues,
            average_latency_ms: metrics.average_latency_ms,
            processed_total: metrics.processed_total,
            failed_total: metrics.failed_total,
            cadence: self.engine.cadence().statuses(),
            isolation_violations: violations.len(),
            sessions,
            reason_codes,
        }
    }
}

fn deep_queues(depths: &BTreeMap<String, usize>, threshold: usize) -> Vec<String> {
    depths
        .iter()
        .filter(|(_, depth)| **depth > threshold)
        .map(|(contact, _)| contact.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `SessionMonitorOptions` used by [`start_session_monitor`].
pub struct SessionMonitorOptions {
    pub interval: Duration,
    pub snapshot_path: Option<PathBuf>,
}

impl SessionMonitorOptions {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            interval: config.monitor_interval,
            snapshot_path: None,
        }
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

#[derive(Debug)]
/// Public struct `SessionMonitorHandle` returned by [`start_session_monitor`].
pub struct SessionMonitorHandle {
    snapshot_path: Option<PathBuf>,
    snapshots: watch::Receiver<MonitorSnapshot>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionMonitorHandle {
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> MonitorSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the monitor loop; missed ticks are skipped.
pub fn start_session_monitor(
    engine: InterviewEngine,
    options: SessionMonitorOptions,
) -> Result<SessionMonitorHandle> {
    if options.interval.is_zero() {
        anyhow::bail!("session monitor interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("session monitor requires an active Tokio runtime")?;

    let bootstrap = MonitorSnapshot::empty(MONITOR_STATE_STARTING);
    if let Some(path) = &options.snapshot_path {
        write_json_atomic(path, &bootstrap).with_context(|| {
            format!("failed to write monitor snapshot {}", path.display())
        })?;
    }
    let (snapshot_tx, snapshot_rx) = watch::channel(bootstrap);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let snapshot_path = options.snapshot_path.clone();
    let interval_ms = duration_to_ms(options.interval);
    let task = handle.spawn(async move {
        run_session_monitor_loop(SessionMonitor::new(engine), options, snapshot_tx, shutdown_rx)
            .await;
    });
    tracing::info!(interval_ms, "session monitor started");
    Ok(SessionMonitorHandle {
        snapshot_path,
        snapshots: snapshot_rx,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_session_monitor_loop(
    mut monitor: SessionMonitor,
    options: SessionMonitorOptions,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(options.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = monitor.sweep(Utc::now()).await;
                persist_snapshot(options.snapshot_path.as_deref(), &snapshot);
                snapshot_tx.send_replace(snapshot);
            }
            _ = &mut shutdown_rx => {
                let mut snapshot = snapshot_tx.borrow().clone();
                snapshot.run_state = MONITOR_STATE_STOPPED.to_string();
                snapshot.updated_unix_ms = current_unix_timestamp_ms();
                persist_snapshot(options.snapshot_path.as_deref(), &snapshot);
                snapshot_tx.send_replace(snapshot);
                tracing::info!(ticks = monitor.tick_count(), "session monitor stopped");
                break;
            }
        }
    }
}

fn persist_snapshot(path: Option<&Path>, snapshot: &MonitorSnapshot) {
    let Some(path) = path else {
        return;
    };
    if let Err(error) = write_json_atomic(path, snapshot) {
        tracing::warn!(
            path = %path.display(),
            reason_code = MONITOR_REASON_SNAPSHOT_PERSIST_FAILED,
            error = %error,
            "monitor snapshot persist failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_connectors::{
        InMemoryCandidateDirectory, InMemoryInterviewRecordStore, RecordingTransport,
    };
    use parley_types::{
        CandidateProfile, ContactKey, InboundMessageEvent, InterviewDefinition,
        InterviewQuestion, InterviewStatus,
    };
    use tempfile::tempdir;

    use super::*;
    use crate::engine::EngineCollaborators;

    async fn engine_with_session() -> (InterviewEngine, Arc<InMemoryInterviewRecordStore>) {
        let directory = Arc::new(InMemoryCandidateDirectory::new());
        directory
            .upsert_candidate(
                "acme",
                CandidateProfile {
                    candidate_id: "cand-p".to_string(),
                    contact_id: "+P".to_string(),
                    name: "Pat".to_string(),
                },
            )
            .await;
        directory
            .set_active_interview(
                "acme",
                InterviewDefinition {
                    interview_id: "int-1".to_string(),
                    job_title: String::new(),
                    questions: vec![InterviewQuestion {
                        text: "Q1?".to_string(),
                        ideal_answer: None,
                    }],
                },
            )
            .await;
        let records = Arc::new(InMemoryInterviewRecordStore::new());
        let engine = InterviewEngine::new(
            OrchestratorConfig::default(),
            EngineCollaborators::new(
                Arc::new(RecordingTransport::new()),
                directory,
                records.clone(),
            ),
        )
        .expect("engine");
        engine.connect_slot("acme", 0, "+550").expect("connect");
        engine
            .handle_inbound(InboundMessageEvent::text(Some("acme"), "+P", "1"))
            .await;
        assert!(engine.wait_until_idle(Duration::from_secs(5)).await);
        (engine, records)
    }

    #[tokio::test]
    async fn functional_sweep_evicts_session_idle_past_threshold() {
        let (engine, records) = engine_with_session().await;
        let mut monitor = SessionMonitor::new(engine.clone());

        let fresh = monitor.sweep(Utc::now()).await;
        assert_eq!(fresh.active_sessions, 1);
        assert_eq!(fresh.evicted_sessions, 0);
        assert_eq!(fresh.reason_codes, vec![MONITOR_REASON_SWEEP_OK]);

        let later = Utc::now() + chrono::Duration::minutes(61);
        let snapshot = monitor.sweep(later).await;
        assert_eq!(snapshot.tick_count, 2);
        assert_eq!(snapshot.evicted_sessions, 1);
        assert_eq!(snapshot.active_sessions, 0);
        assert!(engine.session(&ContactKey::new("acme", "+P")).is_none());
        assert_eq!(
            records.records().await[0].status,
            InterviewStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn regression_sweep_defers_eviction_of_busy_contact() {
        let (engine, _records) = engine_with_session().await;
        let key = ContactKey::new("acme", "+P");
        let lease = engine.queue().try_lease(&key).expect("lease");
        let mut monitor = SessionMonitor::new(engine.clone());
        let later = Utc::now() + chrono::Duration::minutes(61);
        let snapshot = monitor.sweep(later).await;
        assert_eq!(snapshot.deferred_evictions, 1);
        assert!(engine.session(&key).is_some());
        drop(lease);
        assert_eq!(monitor.sweep(later).await.evicted_sessions, 1);
    }

    #[test]
    fn unit_deep_queues_are_strictly_above_threshold() {
        let depths = BTreeMap::from([
            ("acme/+1".to_string(), 5_usize),
            ("acme/+2".to_string(), 6_usize),
        ]);
        assert_eq!(deep_queues(&depths, 5), vec!["acme/+2".to_string()]);
    }

    #[tokio::test]
    async fn integration_monitor_loop_publishes_and_persists_until_shutdown() {
        let (engine, _records) = engine_with_session().await;
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("monitor-snapshot.json");
        let options = SessionMonitorOptions {
            interval: Duration::from_millis(20),
            snapshot_path: None,
        }
        .with_snapshot_path(&path);
        let mut handle = start_session_monitor(engine, options).expect("start");
        assert!(handle.is_running());

        let mut snapshots = handle.subscribe();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.latest().tick_count == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "monitor did not tick before timeout"
            );
            let _ = tokio::time::timeout(Duration::from_millis(50), snapshots.changed()).await;
        }
        let latest = handle.latest();
        assert_eq!(latest.active_sessions, 1);
        assert_eq!(latest.sessions[0].contact_id, "+P");

        handle.shutdown().await;
        assert!(!handle.is_running());
        let raw = std::fs::read_to_string(&path).expect("snapshot file");
        let persisted: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(persisted["run_state"], MONITOR_STATE_STOPPED);
        assert!(persisted["tick_count"].as_u64().unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn regression_zero_interval_is_rejected() {
        let (engine, _records) = engine_with_session().await;
        let error = start_session_monitor(
            engine,
            SessionMonitorOptions {
                interval: Duration::ZERO,
                snapshot_path: None,
            },
        )
        .expect_err("zero interval");
        assert!(error.to_string().contains("greater than zero"));
    }
}
