mod common;

use std::sync::Arc;

use chrono::Duration;
use common::tenant;
use connector_sync::{
    ConnectorSyncService, ErrorStatus, ManualClock, RecoveryConfig, RecoveryMetrics,
    RegisterErrorOptions, SqliteConnectorStore, SyncCursor, SyncStatus, SyncSuccessPatch,
};

async fn sqlite_service(dir: &tempfile::TempDir, clock: &ManualClock) -> ConnectorSyncService {
    let store = SqliteConnectorStore::open(dir.path().join("sync.db"), RecoveryConfig::new(3, 30))
        .await
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let store = Arc::new(store);
    ConnectorSyncService::new(store.clone(), store, RecoveryMetrics::default())
}

#[tokio::test]
async fn failing_connector_is_retried_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(common::start());
    let svc = sqlite_service(&dir, &clock).await;
    let t = tenant();
    let failure = || {
        RegisterErrorOptions::new("chatwoot", "502 from upstream")
            .operation("list_conversations")
            .error_kind("http_5xx")
    };

    // Two failed runs, each picked up by the retry poller once due.
    for _ in 0..2 {
        let prior = svc.get_connector_sync_state(t, "chatwoot").await.unwrap();
        svc.mark_connector_sync_running(t, "chatwoot", "http", prior.as_ref())
            .await
            .unwrap();
        let reg = svc
            .record_sync_failure(t, "chatwoot", "http", prior.as_ref(), failure())
            .await
            .unwrap();
        clock.set(reg.next_retry_at);
        let due = svc.list_due_connector_errors(t, None).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, reg.id);
    }

    let state = svc
        .get_connector_sync_state(t, "chatwoot")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Failed);
    assert_eq!(state.retry_count, 2);

    clock.advance(Duration::minutes(1));
    let prior = svc.get_connector_sync_state(t, "chatwoot").await.unwrap();
    let resolved = svc
        .record_sync_success(
            t,
            "chatwoot",
            "http",
            prior.as_ref(),
            &SyncSuccessPatch::new(SyncCursor::new(Some(clock_now(&clock)), None, None)),
        )
        .await
        .unwrap();
    assert_eq!(resolved, 1);
    assert!(svc.list_due_connector_errors(t, None).await.unwrap().is_empty());

    let state = svc
        .get_connector_sync_state(t, "chatwoot")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Ok);
    assert_eq!(state.retry_count, 0);

    assert_eq!(
        svc.metrics(),
        RecoveryMetrics {
            errors_registered: 2,
            errors_resolved: 1,
            sync_failures: 2,
            sync_successes: 1,
            ..RecoveryMetrics::default()
        }
    );
}

#[tokio::test]
async fn operator_requeues_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(common::start());
    let svc = sqlite_service(&dir, &clock).await;
    let t = tenant();
    let opts = RegisterErrorOptions::new("salesforce", "INVALID_SESSION_ID").source_ref("acct-1");

    let mut last = None;
    for _ in 0..3 {
        last = Some(svc.register_connector_error(t, opts.clone()).await.unwrap());
    }
    let dead = last.unwrap();
    assert_eq!(dead.status, ErrorStatus::DeadLetter);
    assert_eq!(svc.summarize_connector_errors(t).await.unwrap().dead_letter, 1);

    let listed = svc.list_dead_letter_errors(t, None).await.unwrap();
    assert_eq!(listed[0].id, dead.id);

    let requeued = svc
        .retry_dead_letter_error(t, dead.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, ErrorStatus::Pending);
    assert_eq!(
        svc.list_due_connector_errors(t, Some(10)).await.unwrap()[0].id,
        dead.id
    );

    assert_eq!(
        svc.resolve_connector_error_by_id(t, dead.id).await.unwrap(),
        Some(dead.id)
    );
    let summary = svc.summarize_connector_errors(t).await.unwrap();
    assert_eq!(summary.open(), 0);
    assert_eq!(summary.resolved, 1);
    assert_eq!(svc.metrics().dead_lettered, 1);
    assert_eq!(svc.metrics().dead_letters_retried, 1);
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    use connector_sync::Clock;
    clock.now()
}
