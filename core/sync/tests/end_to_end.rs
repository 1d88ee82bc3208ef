//! Client and server together: writes made offline reach the server once
//! a cycle runs, and server verdicts come back as outbox state.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use edgeclass_common::{Clock, DeviceId, ManualClock, Quiz, RecordKind, RecordRef, SyncMarker};
use edgeclass_server::ServerDb;
use edgeclass_storage::{
    LocalStore, OutboxStatus, QuestionDraft, QuizDraft, RecordWriter, SqliteStore,
};
use edgeclass_sync::{
    FailureKind, HttpRemote, NetworkOracle, SyncConfig, SyncEngine, SyncEvent, SyncOutcome,
};

struct Client {
    store: Arc<SqliteStore>,
    writer: RecordWriter<SqliteStore>,
    engine: SyncEngine<SqliteStore, HttpRemote>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn client(base_url: &str) -> Client {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("local.db")).unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let writer = RecordWriter::new(
        store.clone(),
        DeviceId::new("device-a").unwrap(),
        clock.clone(),
    );
    let config = SyncConfig::default()
        .with_api_base_url(base_url)
        .with_request_timeout(std::time::Duration::from_secs(5));
    let remote = Arc::new(HttpRemote::new(&config.api_base_url).unwrap());
    let engine = SyncEngine::new(
        store.clone(),
        remote,
        Arc::new(NetworkOracle::new()),
        clock.clone(),
        config,
    );
    Client {
        store,
        writer,
        engine,
        clock,
        _dir: dir,
    }
}

fn draft() -> QuizDraft {
    QuizDraft {
        title: "Fractions".to_string(),
        description: "Halves and quarters".to_string(),
        questions: vec![
            QuestionDraft {
                question: "What is half of 8?".to_string(),
                options: vec!["2".into(), "4".into(), "6".into()],
                correct_answer: 1,
            },
            QuestionDraft {
                question: "What is a quarter of 8?".to_string(),
                options: vec!["2".into(), "4".into(), "6".into()],
                correct_answer: 0,
            },
        ],
    }
}

async fn start_server() -> (String, Arc<ServerDb>) {
    let db = Arc::new(ServerDb::in_memory().unwrap());
    let (addr, _task) = edgeclass_server::spawn("127.0.0.1:0", db.clone())
        .await
        .unwrap();
    (format!("http://{}", addr), db)
}

fn completed(outcome: SyncOutcome) -> edgeclass_sync::SyncResult {
    match outcome {
        SyncOutcome::Completed(result) => result,
        other => panic!("cycle did not run: {:?}", other),
    }
}

#[tokio::test]
async fn test_offline_writes_reach_server() {
    let (base, server) = start_server().await;
    let c = client(&base);

    let user = c.writer.register_user("ada").await.unwrap();
    let quiz = c.writer.create_quiz(&user.id, draft()).await.unwrap();
    assert_eq!(c.store.stats().await.unwrap().pending, 3);

    let result = completed(c.engine.sync_all().await.unwrap());
    assert_eq!(result.items_synced, 3);
    assert_eq!(result.items_failed, 0);

    let stored = server.get_quiz(&quiz.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Fractions");
    assert_eq!(server.get_questions(&quiz.id).await.unwrap().len(), 2);

    let record = c
        .store
        .get_record(&RecordRef::new(RecordKind::Quiz, &quiz.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sync_status, SyncMarker::Synced);

    // The server recomputes the attempt score from the stored questions.
    let attempt = c
        .writer
        .submit_attempt(&quiz.id, &user.id, vec![1, 2])
        .await
        .unwrap();
    assert_eq!(attempt.score, 1);
    completed(c.engine.sync_all().await.unwrap());
    let attempts = server.list_attempts().await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].score, 1);

    let stats = c.engine.stats().await.unwrap();
    assert_eq!(stats.synced, 4);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_unreachable_server_schedules_retry() {
    // Bind and drop to get a port nothing listens on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let c = client(&format!("http://{}", addr));
    let user = c.writer.register_user("ada").await.unwrap();

    let result = completed(c.engine.sync_all().await.unwrap());
    assert_eq!(result.retries_scheduled, 1);

    let entry = &c.store.list_entries().await.unwrap()[0];
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(
        entry.next_retry_at,
        Some(c.clock.now() + Duration::seconds(10))
    );
    assert!(entry.payload.contains(&user.id));

    // Not due yet.
    let result = completed(c.engine.sync_all().await.unwrap());
    assert_eq!(result.items_count, 0);
}

#[tokio::test]
async fn test_stale_update_is_a_conflict() {
    let (base, server) = start_server().await;
    let c = client(&base);
    let mut rx = c.engine.subscribe();

    let user = c.writer.register_user("ada").await.unwrap();
    let quiz = c.writer.create_quiz(&user.id, draft()).await.unwrap();
    completed(c.engine.sync_all().await.unwrap());

    // Another device edits the quiz an hour later.
    let newer = Quiz {
        title: "Fractions (revised)".to_string(),
        updated_at: quiz.updated_at + Duration::hours(1),
        device_id: "device-b".to_string(),
        ..quiz.clone()
    };
    assert!(server.upsert_quiz(&newer).await.unwrap().is_accepted());

    c.clock.advance(Duration::minutes(5));
    c.writer
        .update_quiz(&quiz.id, Some("Fractions 2".to_string()), None)
        .await
        .unwrap();
    let result = completed(c.engine.sync_all().await.unwrap());
    assert_eq!(result.items_failed, 1);
    assert_eq!(result.conflicts_found, 1);

    let failed = c
        .store
        .list_entries()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.status == OutboxStatus::Failed)
        .unwrap();
    assert!(failed.last_error.is_some());

    let mut saw_conflict = false;
    while let Ok(update) = rx.try_recv() {
        if let SyncEvent::ItemFailed { kind, conflict, .. } = update.event {
            assert_eq!(kind, FailureKind::Conflict);
            let conflict = conflict.unwrap();
            assert_eq!(conflict.server_updated_at, Some(newer.updated_at));
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);

    let stored = server.get_quiz(&quiz.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Fractions (revised)");
}

#[tokio::test]
async fn test_delete_reaches_server() {
    let (base, server) = start_server().await;
    let c = client(&base);

    let user = c.writer.register_user("ada").await.unwrap();
    let quiz = c.writer.create_quiz(&user.id, draft()).await.unwrap();
    completed(c.engine.sync_all().await.unwrap());

    c.writer.delete_quiz(&quiz.id).await.unwrap();
    let result = completed(c.engine.sync_all().await.unwrap());
    assert_eq!(result.items_synced, 1);

    assert!(server.get_quiz(&quiz.id).await.unwrap().is_none());
    assert!(c.writer.get_quiz(&quiz.id).await.unwrap().is_none());
}
