//! Draw integration tests
//!
//! End-to-end draws against a file-backed SQLite database, including
//! concurrent callers racing to draw the same group.

use app_core::{DrawConfig, DrawError, DrawService, DrawStatus};
use std::collections::HashSet;
use std::sync::Arc;
use storage::{AssignmentPair, DatabaseConfig, GroupStore};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn file_store(dir: &TempDir) -> Arc<GroupStore> {
    let path = dir.path().join("amigo.db");
    let config = DatabaseConfig::new(path.to_string_lossy().to_string()).max_connections(8);
    Arc::new(GroupStore::open(config).await.unwrap())
}

async fn confirmed_group(store: &GroupStore, members: &[&str]) -> String {
    let group = store.create_group("Navidad", None, members[0]).await.unwrap();
    for member in &members[1..] {
        store.add_participant(&group.id, member).await.unwrap();
    }
    for member in members {
        store.confirm_participant(&group.id, member).await.unwrap();
    }
    group.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_draws_write_one_set() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let members = ["ana", "beto", "carla", "dani", "eva", "fede"];
    let group_id = confirmed_group(&store, &members).await;

    let service = Arc::new(DrawService::new(store.clone(), DrawConfig::default()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let group_id = group_id.clone();
        handles.push(tokio::spawn(async move { service.perform_draw(&group_id).await }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(report) => {
                successes += 1;
                assert_eq!(report.participant_count, members.len());
            }
            Err(e) => assert_eq!(e, DrawError::AlreadyDrawn),
        }
    }
    assert_eq!(successes, 1);

    let rows = store.list_assignments(&group_id).await.unwrap();
    assert_eq!(rows.len(), members.len());
    let receivers: HashSet<_> = rows.iter().map(|r| r.receiver_id.as_str()).collect();
    assert_eq!(receivers.len(), members.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_raw_writes_hit_unique_constraint() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let group_id = confirmed_group(&store, &["ana", "beto"]).await;

    // Every writer skips the existence check, so only the schema can stop
    // the second set.
    let mut handles = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        let group_id = group_id.clone();
        let pairs = if i % 2 == 0 {
            vec![
                AssignmentPair {
                    giver_id: "ana".into(),
                    receiver_id: "beto".into(),
                },
                AssignmentPair {
                    giver_id: "beto".into(),
                    receiver_id: "ana".into(),
                },
            ]
        } else {
            vec![
                AssignmentPair {
                    giver_id: "beto".into(),
                    receiver_id: "ana".into(),
                },
                AssignmentPair {
                    giver_id: "ana".into(),
                    receiver_id: "beto".into(),
                },
            ]
        };
        handles.push(tokio::spawn(async move {
            store.insert_assignments(&group_id, &pairs).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(store.list_assignments(&group_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_second_draw_leaves_storage_unchanged() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let group_id = confirmed_group(&store, &["ana", "beto", "carla"]).await;
    let service = DrawService::new(store.clone(), DrawConfig::default());

    assert_eq!(service.draw_status(&group_id).await.unwrap(), DrawStatus::NotDrawn);
    service.perform_draw(&group_id).await.unwrap();
    let before = store.list_assignments(&group_id).await.unwrap();

    let err = service.perform_draw(&group_id).await.unwrap_err();
    assert_eq!(err.reason(), "already-drawn");
    assert_eq!(store.list_assignments(&group_id).await.unwrap(), before);
    assert_eq!(service.draw_status(&group_id).await.unwrap(), DrawStatus::Drawn);
}

#[tokio::test]
async fn test_only_confirmed_participants_are_drawn() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let group_id = confirmed_group(&store, &["ana", "beto", "carla"]).await;
    store.add_participant(&group_id, "dani").await.unwrap();

    let service = DrawService::new(store.clone(), DrawConfig::default());
    let report = service.perform_draw(&group_id).await.unwrap();
    assert_eq!(report.participant_count, 3);

    let rows = store.list_assignments(&group_id).await.unwrap();
    assert!(rows.iter().all(|r| r.giver_id != "dani" && r.receiver_id != "dani"));
}

#[tokio::test]
async fn test_one_confirmed_participant_is_insufficient() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let group = store.create_group("Solo", None, "ana").await.unwrap();
    store.add_participant(&group.id, "beto").await.unwrap();
    store.confirm_participant(&group.id, "ana").await.unwrap();

    let service = DrawService::new(store.clone(), DrawConfig::default());
    let err = service.perform_draw(&group.id).await.unwrap_err();
    assert_eq!(err, DrawError::InsufficientParticipants { found: 1 });
    assert!(!store.has_assignments(&group.id).await.unwrap());
}

#[tokio::test]
async fn test_infeasible_restrictions_leave_group_undrawn() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let group_id = confirmed_group(&store, &["ana", "beto", "carla"]).await;
    for (user, others) in [
        ("ana", ["beto", "carla"]),
        ("beto", ["ana", "carla"]),
        ("carla", ["ana", "beto"]),
    ] {
        let others: Vec<String> = others.iter().map(|s| s.to_string()).collect();
        store.set_restrictions(&group_id, user, &others).await.unwrap();
    }

    let service = DrawService::new(store.clone(), DrawConfig::default().max_attempts(200));
    let err = service.perform_draw(&group_id).await.unwrap_err();
    assert_eq!(
        err,
        DrawError::UnsatisfiableConstraints {
            attempts: 200,
            proven_infeasible: true,
        }
    );
    assert_eq!(service.draw_status(&group_id).await.unwrap(), DrawStatus::NotDrawn);
}

#[tokio::test]
async fn test_draws_survive_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let group_id = {
        let store = file_store(&dir).await;
        let group_id = confirmed_group(&store, &["ana", "beto"]).await;
        DrawService::new(store.clone(), DrawConfig::default())
            .perform_draw(&group_id)
            .await
            .unwrap();
        store.database().close().await;
        group_id
    };

    let store = file_store(&dir).await;
    let service = DrawService::new(store.clone(), DrawConfig::default());
    assert_eq!(service.draw_status(&group_id).await.unwrap(), DrawStatus::Drawn);
    let ana = store.find_assignment(&group_id, "ana").await.unwrap().unwrap();
    assert_eq!(ana.receiver_id, "beto");
}
