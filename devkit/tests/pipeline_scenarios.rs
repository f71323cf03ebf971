use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use sentinel_devkit::{wait_until, TestHarness};
use sentinel_kernel::connections::Presence;
use sentinel_kernel::models::{MachineStatus, Severity};
use sentinel_kernel::protocol::messages::MessageKind;
use sentinel_kernel::protocol::validator::FailureKind;
use sentinel_kernel::protocol::PipelineOutcome;
use sentinel_kernel::store::PersistenceGateway;

const SETTLE: Duration = Duration::from_secs(2);

fn rejected(outcome: PipelineOutcome) -> FailureKind {
    match outcome {
        PipelineOutcome::Rejected(failure) => failure.kind,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_messages_leave_the_connection_running_and_the_cache_untouched() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();
    let before = harness.kernel.cache.get("m1").unwrap();

    let (tx, task) = harness.spawn_connection("m1", Presence::default());
    tx.send(b"{not json".to_vec()).await.unwrap();
    tx.send(vec![0xff, 0xfe, 0x00]).await.unwrap();
    tx.send(br#"{"kind":"heartbeat","machine_id":"","msg_id":"x","ts":1,"nonce":"n","signature":"s"}"#.to_vec())
        .await
        .unwrap();

    let pipeline = &harness.kernel.pipeline;
    assert!(wait_until(SETTLE, || async move { pipeline.stats().malformed == 3 }).await);
    assert!(Arc::ptr_eq(&before, &harness.kernel.cache.get("m1").unwrap()));
    assert!(!task.is_finished());

    // the same task still serves well-formed traffic
    tx.send(agent.metrics(55.0, 40.0, 70.0)).await.unwrap();
    let cache = &harness.kernel.cache;
    assert!(wait_until(SETTLE, || async move { cache.get("m1").is_some_and(|m| m.metrics.is_some()) }).await);
    let metrics = harness.kernel.cache.get("m1").unwrap().metrics.clone().unwrap();
    assert_eq!(metrics.cpu_percent, 55.0);
    assert_eq!(harness.kernel.pipeline.stats().handled, 2);

    drop(tx);
    task.await.unwrap();
}

#[tokio::test]
async fn only_authenticated_traffic_marks_an_agent_present() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let presence = Presence::default();
    let (tx, task) = harness.spawn_connection("m1", presence.clone());
    tx.send(agent.message("heartbeat", json!({})).secret("not-the-key").build()).await.unwrap();
    tx.send(b"{not json".to_vec()).await.unwrap();

    let pipeline = &harness.kernel.pipeline;
    assert!(wait_until(SETTLE, || async move { pipeline.stats().processed == 3 }).await);
    assert!(!presence.is_connected("m1"));

    tx.send(agent.heartbeat(MachineStatus::Online)).await.unwrap();
    let seen = &presence;
    assert!(wait_until(SETTLE, || async move { seen.is_connected("m1") }).await);

    drop(tx);
    task.await.unwrap();
}

#[tokio::test]
async fn a_replayed_message_is_audited_once_and_changes_nothing() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let degraded = agent.message("heartbeat", json!({ "status": "degraded" })).build();
    assert_eq!(harness.deliver("m1", &degraded).await, PipelineOutcome::Handled(MessageKind::Heartbeat));
    assert_eq!(
        harness.deliver("m1", &agent.heartbeat(MachineStatus::Online)).await,
        PipelineOutcome::Handled(MessageKind::Heartbeat)
    );
    let before = harness.kernel.cache.get("m1").unwrap();

    assert_eq!(rejected(harness.deliver("m1", &degraded).await), FailureKind::Replay);

    let h = &harness;
    assert!(wait_until(SETTLE, || async move {
        h.audit_entries("protocol.reject").await.unwrap().len() == 1
    })
    .await);
    let after = harness.kernel.cache.get("m1").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.status, MachineStatus::Online);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries = harness.audit_entries("protocol.reject").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].machine_id.as_deref(), Some("m1"));
    assert_eq!(entries[0].severity, Severity::High);
    assert_eq!(entries[0].details["failure"], "replay");
}

#[tokio::test]
async fn forged_spoofed_and_stale_messages_are_rejected_and_audited() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let forged = agent.message("heartbeat", json!({})).secret("not-the-key").build();
    assert_eq!(rejected(harness.deliver("m1", &forged).await), FailureKind::BadSignature);

    let spoofed = agent.message("heartbeat", json!({})).machine_id("m2").build();
    assert_eq!(rejected(harness.deliver("m1", &spoofed).await), FailureKind::IdentityMismatch);

    let an_hour_ago = OffsetDateTime::now_utc().unix_timestamp() - 3600;
    let stale = agent.message("heartbeat", json!({})).ts(an_hour_ago).build();
    assert_eq!(rejected(harness.deliver("m1", &stale).await), FailureKind::Stale);

    let h = &harness;
    assert!(wait_until(SETTLE, || async move {
        h.audit_entries("protocol.reject").await.unwrap().len() == 3
    })
    .await);
    assert_eq!(harness.kernel.pipeline.stats().rejected, 3);
}

#[tokio::test]
async fn payload_range_errors_are_rejected_without_an_audit_entry() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let kind = rejected(harness.deliver("m1", &agent.metrics(150.0, 10.0, 10.0)).await);
    assert!(!kind.is_security_relevant());
    assert!(harness.kernel.cache.get("m1").unwrap().metrics.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.audit_entries("protocol.reject").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_kinds_are_reported_not_handled() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let raw = agent.message("firmware_update", json!({ "version": "2.0" })).build();
    assert_eq!(
        harness.deliver("m1", &raw).await,
        PipelineOutcome::UnknownKind("firmware_update".to_string())
    );
    assert_eq!(harness.kernel.pipeline.stats().unknown, 1);
}

#[tokio::test]
async fn file_integrity_events_take_the_severity_of_the_path() {
    let harness = TestHarness::new().await.unwrap();
    let agent = harness.agent("m1");
    harness.register(&agent, "10.0.0.1").await.unwrap();

    let raw = agent.security_event("file_integrity", Some("/etc/shadow"), Severity::Low);
    assert_eq!(harness.deliver("m1", &raw).await, PipelineOutcome::Handled(MessageKind::SecurityEvent));
    let raw = agent.security_event("file_integrity", Some("/tmp/cache.db"), Severity::High);
    assert_eq!(harness.deliver("m1", &raw).await, PipelineOutcome::Handled(MessageKind::SecurityEvent));

    let machine = harness.kernel.cache.get("m1").unwrap();
    assert_eq!(machine.security.open_count, 2);
    assert_eq!(machine.security.highest, Some(Severity::Critical));

    let events = harness.store.list_security_events(Some("m1")).await.unwrap();
    let severities: Vec<Severity> = events.iter().map(|e| e.severity).collect();
    assert_eq!(severities, vec![Severity::Critical, Severity::Low]);

    // only the critical one reaches the audit trail
    let h = &harness;
    assert!(wait_until(SETTLE, || async move {
        h.audit_entries("security.event").await.unwrap().len() == 1
    })
    .await);
}

#[tokio::test]
async fn messages_from_unregistered_machines_fail_in_the_handler() {
    let harness = TestHarness::new().await.unwrap();
    let ghost = harness.agent("ghost");

    let outcome = harness.deliver("ghost", &ghost.heartbeat(MachineStatus::Online)).await;
    assert!(matches!(outcome, PipelineOutcome::HandlerFailed { kind: MessageKind::Heartbeat, .. }));
    assert!(harness.kernel.cache.get("ghost").is_none());
    assert_eq!(harness.kernel.pipeline.stats().handler_failures, 1);
}
