use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use parley_connectors::{
    InMemoryCandidateDirectory, InMemoryInterviewRecordStore, KeywordOverlapScorer,
    RecordingTransport,
};
use parley_orchestrator::{
    start_session_monitor, EngineCollaborators, InterviewEngine, OrchestratorConfig,
    PacingConfig, SessionMonitor, SessionMonitorOptions, SlotRegistryError,
};
use parley_types::{
    CandidateProfile, ContactKey, DistributionPriority, InboundMessageEvent, InterviewDefinition,
    InterviewQuestion, InterviewStatus,
};

const TENANT: &str = "acme";

struct Harness {
    engine: InterviewEngine,
    transport: Arc<RecordingTransport>,
    directory: Arc<InMemoryCandidateDirectory>,
    records: Arc<InMemoryInterviewRecordStore>,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        question_delay: Duration::from_millis(1),
        pacing: PacingConfig {
            batch_delay: Duration::from_millis(2),
            urgent_delay: Duration::from_millis(2),
            immediate_delay: Duration::from_millis(1),
            adaptive_pacing: true,
            adaptive_max_multiplier: 4,
        },
        ..OrchestratorConfig::default()
    }
}

fn questions(count: usize) -> Vec<InterviewQuestion> {
    (1..=count)
        .map(|index| InterviewQuestion {
            text: format!("Question {index}?"),
            ideal_answer: Some(format!("answer {index} keywords")),
        })
        .collect()
}

async fn harness_with(
    config: OrchestratorConfig,
    transport: RecordingTransport,
    question_count: usize,
    slots: &[(u32, &str)],
) -> Harness {
    let transport = Arc::new(transport);
    let directory = Arc::new(InMemoryCandidateDirectory::new());
    let records = Arc::new(InMemoryInterviewRecordStore::new());
    directory
        .set_active_interview(
            TENANT,
            InterviewDefinition {
                interview_id: "int-acme".to_string(),
                job_title: "Store associate".to_string(),
                questions: questions(question_count),
            },
        )
        .await;
    let collaborators =
        EngineCollaborators::new(transport.clone(), directory.clone(), records.clone())
            .with_scorer(Arc::new(KeywordOverlapScorer));
    let engine = InterviewEngine::new(config, collaborators).expect("engine");
    for (slot_number, identity) in slots {
        engine
            .connect_slot(TENANT, *slot_number, identity)
            .expect("connect slot");
    }
    Harness {
        engine,
        transport,
        directory,
        records,
    }
}

async fn add_candidate(harness: &Harness, tenant_id: &str, contact_id: &str) {
    harness
        .directory
        .upsert_candidate(
            tenant_id,
            CandidateProfile {
                candidate_id: format!("cand-{contact_id}"),
                contact_id: contact_id.to_string(),
                name: contact_id.to_string(),
            },
        )
        .await;
}

async fn send(harness: &Harness, contact_id: &str, text: &str) {
    let outcome = harness
        .engine
        .handle_inbound(InboundMessageEvent::text(Some(TENANT), contact_id, text))
        .await;
    assert!(outcome.is_queued(), "message for {contact_id} must queue");
}

async fn settle(engine: &InterviewEngine) {
    assert!(
        engine.wait_until_idle(Duration::from_secs(5)).await,
        "engine must drain queues and cadence lanes"
    );
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met before deadline");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn integration_scenario_a_three_question_interview_completes() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 3, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;
    let key = ContactKey::new(TENANT, "P");

    send(&harness, "P", "1").await;
    settle(&harness.engine).await;
    let session = harness.engine.session(&key).expect("session after opt-in");
    assert_eq!(
        session.status(),
        InterviewStatus::AwaitingResponse { question_index: 0 }
    );
    assert_eq!(harness.transport.texts_for(TENANT, "P"), vec!["Question 1?"]);

    send(&harness, "P", "ans1").await;
    settle(&harness.engine).await;
    let session = harness.engine.session(&key).expect("session after ans1");
    assert_eq!(session.current_question_index(), 1);
    assert_eq!(
        harness.transport.texts_for(TENANT, "P").last().map(String::as_str),
        Some("Question 2?")
    );

    send(&harness, "P", "ans2").await;
    settle(&harness.engine).await;
    let session = harness.engine.session(&key).expect("session after ans2");
    assert_eq!(session.current_question_index(), 2);
    assert_eq!(
        harness.transport.texts_for(TENANT, "P").last().map(String::as_str),
        Some("Question 3?")
    );

    send(&harness, "P", "ans3").await;
    settle(&harness.engine).await;
    assert!(harness.engine.session(&key).is_none(), "completed session is removed");
    let texts = harness.transport.texts_for(TENANT, "P");
    assert_eq!(texts.len(), 4);
    assert_eq!(
        texts.last().map(String::as_str),
        Some(harness.engine.config().replies.closing_text.as_str())
    );

    let records = harness.records.records_for_contact(TENANT, "P").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, InterviewStatus::Completed);
    let answers = records[0]
        .responses
        .iter()
        .map(|response| response.text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(answers, vec!["ans1", "ans2", "ans3"]);
}

#[tokio::test]
async fn integration_scenario_b_seven_contacts_over_three_slots() {
    let harness = harness_with(
        fast_config(),
        RecordingTransport::new(),
        1,
        &[(0, "+550"), (1, "+551"), (2, "+552")],
    )
    .await;
    let contacts = (0..7).map(|index| format!("c{index}")).collect::<Vec<_>>();

    let distributions = harness
        .engine
        .start_invitations(TENANT, &contacts, DistributionPriority::Normal)
        .expect("distribution");
    let mut sizes = distributions
        .iter()
        .map(|distribution| distribution.contacts.len())
        .collect::<Vec<_>>();
    sizes.sort_unstable_by(|left, right| right.cmp(left));
    assert_eq!(sizes, vec![3, 2, 2]);
    let slot_zero = distributions
        .iter()
        .find(|distribution| distribution.slot_number == 0)
        .expect("slot 0 distribution");
    assert_eq!(slot_zero.contacts, vec!["c0", "c3", "c6"]);

    settle(&harness.engine).await;
    let invitation = harness.engine.config().replies.invitation_text.clone();
    for contact in &contacts {
        assert_eq!(
            harness.transport.texts_for(TENANT, contact),
            vec![invitation.clone()],
            "{contact} receives exactly one invitation"
        );
    }
    let batch = harness.engine.cadence().batch(TENANT).expect("batch");
    assert!(!batch.active, "drained batch deactivates");
    assert_eq!(batch.sent, 7);
    assert_eq!(batch.errors, 0);
}

#[tokio::test]
async fn integration_scenario_c_idle_session_times_out_after_sixty_one_minutes() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 2, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;
    send(&harness, "P", "1").await;
    settle(&harness.engine).await;
    let key = ContactKey::new(TENANT, "P");
    assert!(harness.engine.session(&key).is_some());

    let mut monitor = SessionMonitor::new(harness.engine.clone());
    let at_fifty_nine = monitor
        .sweep(Utc::now() + chrono::Duration::minutes(59))
        .await;
    assert_eq!(at_fifty_nine.evicted_sessions, 0);
    assert_eq!(at_fifty_nine.active_sessions, 1);

    let at_sixty_one = monitor
        .sweep(Utc::now() + chrono::Duration::minutes(61))
        .await;
    assert_eq!(at_sixty_one.evicted_sessions, 1);
    assert_eq!(at_sixty_one.active_sessions, 0);
    assert!(harness.engine.session(&key).is_none());

    let records = harness.records.records_for_contact(TENANT, "P").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, InterviewStatus::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_scenario_d_immediate_opt_in_merges_into_active_batch() {
    let config = OrchestratorConfig {
        pacing: PacingConfig {
            batch_delay: Duration::from_millis(400),
            ..fast_config().pacing
        },
        ..fast_config()
    };
    let harness = harness_with(
        config,
        RecordingTransport::with_latency(Duration::from_millis(300)),
        1,
        &[(0, "+550"), (1, "+551")],
    )
    .await;
    add_candidate(&harness, TENANT, "C").await;

    harness
        .engine
        .start_invitations(
            TENANT,
            &["A".to_string(), "B".to_string()],
            DistributionPriority::Normal,
        )
        .expect("batch");
    send(&harness, "C", "1").await;

    let cadence = harness.engine.cadence();
    wait_for(|| cadence.placement(TENANT, "C").is_some()).await;
    let batch = cadence.active_batch(TENANT).expect("batch still active");
    assert_eq!(batch.contacts, vec!["A", "B", "C"]);
    let placed = cadence.placement(TENANT, "C").expect("placement");
    assert!(placed == 0 || placed == 1);

    settle(&harness.engine).await;
    let batch = cadence.batch(TENANT).expect("batch");
    assert_eq!(batch.contacts, vec!["A", "B", "C"], "no duplicate entry for C");
    assert_eq!(
        harness.transport.texts_for(TENANT, "C"),
        vec!["Question 1?"],
        "C receives the first question, not an invitation"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn functional_stopped_batch_drops_pending_and_disconnected_slot_is_skipped() {
    let config = OrchestratorConfig {
        pacing: PacingConfig {
            batch_delay: Duration::from_millis(500),
            ..fast_config().pacing
        },
        ..fast_config()
    };
    let harness = harness_with(
        config,
        RecordingTransport::new(),
        1,
        &[(0, "+550"), (1, "+551")],
    )
    .await;
    let contacts = (0..6).map(|index| format!("c{index}")).collect::<Vec<_>>();
    harness
        .engine
        .start_invitations(TENANT, &contacts, DistributionPriority::Normal)
        .expect("batch");

    let stopped = harness.engine.stop_invitations(TENANT).expect("stopped batch");
    assert!(!stopped.active);
    assert_eq!(stopped.contacts.len(), 6);
    settle(&harness.engine).await;
    let invited = contacts
        .iter()
        .filter(|contact| !harness.transport.texts_for(TENANT, contact).is_empty())
        .count();
    assert!(invited < contacts.len(), "pending invitations are dropped");

    assert!(harness.engine.disconnect_slot(TENANT, 1));
    assert!(!harness.engine.disconnect_slot(TENANT, 9));
    let active = harness.engine.get_active_slots(TENANT);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].slot_number, 0);

    let distributions = harness
        .engine
        .start_invitations(
            TENANT,
            &["x".to_string(), "y".to_string()],
            DistributionPriority::Urgent,
        )
        .expect("second batch");
    assert_eq!(distributions.len(), 1);
    assert_eq!(distributions[0].slot_number, 0);
    assert_eq!(distributions[0].contacts, vec!["x", "y"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn functional_burst_for_one_contact_is_processed_in_arrival_order() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 4, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;

    for text in ["1", "first", "second", "third"] {
        send(&harness, "P", text).await;
    }
    settle(&harness.engine).await;

    let session = harness
        .engine
        .session(&ContactKey::new(TENANT, "P"))
        .expect("session");
    let answers = session
        .responses()
        .iter()
        .map(|response| (response.question_index, response.text.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(answers, vec![(0, "first"), (1, "second"), (2, "third")]);
    assert_eq!(
        harness.transport.texts_for(TENANT, "P"),
        vec!["Question 1?", "Question 2?", "Question 3?", "Question 4?"],
        "every question goes out once, in order"
    );
    let metrics = harness.engine.queue().metrics();
    assert_eq!(metrics.processed_total, 4);
    assert_eq!(metrics.failed_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn regression_quick_reply_after_opt_in_answers_the_first_question() {
    let config = OrchestratorConfig {
        pacing: PacingConfig {
            batch_delay: Duration::from_millis(300),
            ..fast_config().pacing
        },
        ..fast_config()
    };
    let harness = harness_with(
        config,
        RecordingTransport::with_latency(Duration::from_millis(200)),
        3,
        &[(0, "+550")],
    )
    .await;
    add_candidate(&harness, TENANT, "P").await;
    harness
        .engine
        .start_invitations(
            TENANT,
            &["A".to_string(), "B".to_string()],
            DistributionPriority::Normal,
        )
        .expect("batch");

    send(&harness, "P", "1").await;
    send(&harness, "P", "ans1").await;
    settle(&harness.engine).await;

    assert_eq!(
        harness.transport.texts_for(TENANT, "P"),
        vec!["Question 1?", "Question 2?"]
    );
    let session = harness
        .engine
        .session(&ContactKey::new(TENANT, "P"))
        .expect("session");
    let answers = session
        .responses()
        .iter()
        .map(|response| (response.question_index, response.text.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(answers, vec![(0, "ans1")]);
    let batch = harness.engine.cadence().batch(TENANT).expect("batch");
    assert_eq!(batch.contacts, vec!["A", "B", "P"]);
    assert_eq!(batch.sent, 3);
}

#[tokio::test]
async fn regression_numeric_reply_during_interview_is_recorded_as_answer() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 2, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;

    send(&harness, "P", "1").await;
    settle(&harness.engine).await;
    send(&harness, "P", "2").await;
    settle(&harness.engine).await;

    let session = harness
        .engine
        .session(&ContactKey::new(TENANT, "P"))
        .expect("still interviewing");
    assert_eq!(session.current_question_index(), 1);
    assert_eq!(session.responses()[0].text, "2");
}

#[tokio::test]
async fn functional_stop_cancels_session_and_record() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 3, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;

    send(&harness, "P", "1").await;
    settle(&harness.engine).await;
    send(&harness, "P", "STOP").await;
    settle(&harness.engine).await;

    assert!(harness.engine.session(&ContactKey::new(TENANT, "P")).is_none());
    let records = harness.records.records_for_contact(TENANT, "P").await;
    assert_eq!(records[0].status, InterviewStatus::Cancelled);
}

#[tokio::test]
async fn regression_tenant_isolation_keeps_identities_and_sessions_apart() {
    let harness = harness_with(fast_config(), RecordingTransport::new(), 1, &[(0, "+550")]).await;

    let error = harness
        .engine
        .connect_slot("globex", 0, "+550")
        .expect_err("identity already bound to acme");
    assert!(matches!(error, SlotRegistryError::IsolationViolation { .. }));
    harness
        .engine
        .connect_slot("globex", 0, "+660")
        .expect("distinct identity");
    assert!(harness.engine.slots().audit_tenant_isolation().is_empty());

    add_candidate(&harness, TENANT, "P").await;
    harness
        .directory
        .set_active_interview(
            "globex",
            InterviewDefinition {
                interview_id: "int-globex".to_string(),
                job_title: String::new(),
                questions: questions(2),
            },
        )
        .await;
    add_candidate(&harness, "globex", "Q").await;

    send(&harness, "P", "1").await;
    harness
        .engine
        .handle_inbound(InboundMessageEvent::text(None, "Q", "1"))
        .await;
    settle(&harness.engine).await;

    let acme = harness
        .engine
        .session(&ContactKey::new(TENANT, "P"))
        .expect("acme session");
    let globex = harness
        .engine
        .session(&ContactKey::new("globex", "Q"))
        .expect("globex session resolved through directory");
    assert_eq!(acme.interview_id, "int-acme");
    assert_eq!(globex.interview_id, "int-globex");
    assert!(harness
        .transport
        .sent()
        .iter()
        .filter(|record| record.tenant_id == "globex")
        .all(|record| record.slot_number == 0 && record.contact_id == "Q"));
}

#[tokio::test]
async fn integration_background_monitor_persists_snapshot() {
    let config = OrchestratorConfig {
        monitor_interval: Duration::from_millis(20),
        ..fast_config()
    };
    let harness = harness_with(config, RecordingTransport::new(), 2, &[(0, "+550")]).await;
    add_candidate(&harness, TENANT, "P").await;
    send(&harness, "P", "1").await;
    settle(&harness.engine).await;

    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("state/monitor-snapshot.json");
    let mut handle = start_session_monitor(
        harness.engine.clone(),
        SessionMonitorOptions::from_config(harness.engine.config()).with_snapshot_path(&path),
    )
    .expect("monitor");
    let mut updates = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|snapshot| snapshot.tick_count >= 2),
    )
    .await
    .expect("ticks before timeout")
    .expect("monitor channel open");
    handle.shutdown().await;
    assert!(!handle.is_running());

    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("snapshot file"))
            .expect("snapshot json");
    assert_eq!(persisted["run_state"], "stopped");
    assert_eq!(persisted["active_sessions"], 1);
    assert_eq!(persisted["sessions"][0]["contact_id"], "P");
}
