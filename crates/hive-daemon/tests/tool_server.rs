//! `hive-daemon tools` driven by the worker's stdio backlog client.
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use hive_agent::{Backlog, StdioBacklog};
use hive_store::Database;
use hive_store::storage::{FeatureKind, NewFeature};
use serde_json::json;
use tempfile::TempDir;

const DAEMON: &str = env!("CARGO_BIN_EXE_hive-daemon");

async fn seeded_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("features.db");
    let db = Database::open(&path).await.unwrap();
    let items = vec![NewFeature {
        kind: FeatureKind::Feature,
        category: "tools".into(),
        name: "served".into(),
        description: "reached through the tool server".into(),
        steps: vec!["only".into()],
    }];
    db.create_batch(&items, None).await.unwrap();
    path
}

/// The server command carries no `--db`; the path must arrive via env.
fn server_command() -> String {
    format!("'{DAEMON}' tools")
}

#[tokio::test]
async fn stdio_backlog_works_a_feature_through_the_daemon() {
    let dir = TempDir::new().unwrap();
    let db_path = seeded_db(&dir).await;

    let backlog = StdioBacklog::spawn(&server_command(), &db_path, false).unwrap();
    let feature = backlog.claim_next("agent-1").await.unwrap();
    assert_eq!(feature.name, "served");
    assert_eq!(feature.owner.as_deref(), Some("agent-1"));

    backlog.step_started(feature.id, 0).await.unwrap();
    let step = backlog
        .step_completed(feature.id, 0, Some("done"))
        .await
        .unwrap();
    assert_eq!(step.notes.as_deref(), Some("done"));
    backlog.complete(feature.id).await.unwrap();

    let err = backlog.claim_next("agent-1").await.unwrap_err();
    assert!(err.is_not_available());

    // Regression sampling is allowed outside yolo mode.
    let sample = backlog.call("regression", json!({})).await.unwrap();
    assert_eq!(sample["count"], 1);
    drop(backlog);

    let stats = Database::open(&db_path).await.unwrap().stats().await.unwrap();
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn yolo_mode_reaches_the_tool_server() {
    let dir = TempDir::new().unwrap();
    let db_path = seeded_db(&dir).await;

    let backlog = StdioBacklog::spawn(&server_command(), &db_path, true).unwrap();
    let err = backlog.call("regression", json!({})).await.unwrap_err();
    match err {
        hive_agent::BacklogError::Tool { kind, .. } => assert_eq!(kind, "forbidden"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(backlog.stats().await.unwrap().total, 1);
}
