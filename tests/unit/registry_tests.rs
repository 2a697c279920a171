//! Unit tests for the store-backed session registry.

use std::path::PathBuf;

use duo_relay::models::{Liveness, SessionRecord, Workspace};
use duo_relay::persistence::Store;
use duo_relay::registry::SessionRegistry;
use duo_relay::AppError;

fn record(name: &str) -> SessionRecord {
    SessionRecord {
        name: name.into(),
        session_id: format!("sess-{name}"),
        model: Some("gpt-5.2".into()),
        workspace: "acme-widgets-7".into(),
        cwd: PathBuf::from("/work"),
        pid: 0,
        fifo_path: PathBuf::from(format!("/tmp/duo-acme-widgets-7-{name}-aaaaaaaa.fifo")),
        log_path: PathBuf::from(format!("/tmp/duo-acme-widgets-7-{name}.log")),
    }
}

async fn registry() -> SessionRegistry {
    let store = Store::open_memory(3).await.expect("memory store");
    SessionRegistry::new(&store, &Workspace::new("acme/widgets", "7"))
}

#[tokio::test]
async fn recorded_session_loads_back() {
    let registry = registry().await;
    let rec = record("opus");
    registry.record(&rec).await.expect("record");

    let loaded = registry.load("opus").await.expect("load").expect("present");
    assert_eq!(loaded, rec);
}

#[tokio::test]
async fn unknown_agent_is_none_and_require_fails() {
    let registry = registry().await;
    assert!(registry.load("ghost").await.expect("load").is_none());
    assert!(matches!(
        registry.require("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(
        registry.liveness("ghost").await.expect("liveness"),
        Liveness::Unknown
    );
}

#[tokio::test]
async fn endpoint_update_keeps_identity() {
    let registry = registry().await;
    registry.record(&record("opus")).await.expect("record");

    let fifo = PathBuf::from("/tmp/duo-acme-widgets-7-opus-bbbbbbbb.fifo");
    let log = PathBuf::from("/tmp/duo-acme-widgets-7-opus.log");
    registry
        .update_endpoint("opus", 4242, &fifo, &log)
        .await
        .expect("update");

    let loaded = registry.require("opus").await.expect("present");
    assert_eq!(loaded.session_id, "sess-opus");
    assert_eq!(loaded.model.as_deref(), Some("gpt-5.2"));
    assert_eq!(loaded.pid, 4242);
    assert_eq!(loaded.fifo_path, fifo);
}

#[tokio::test]
async fn dead_pid_reports_dead() {
    let registry = registry().await;
    registry.record(&record("opus")).await.expect("record");
    assert_eq!(
        registry.liveness("opus").await.expect("liveness"),
        Liveness::Dead
    );
}

#[tokio::test]
async fn agents_lists_records_and_remove_forgets() {
    let registry = registry().await;
    registry.record(&record("opus")).await.expect("record");
    registry.record(&record("codex")).await.expect("record");

    let names: Vec<_> = registry
        .agents()
        .await
        .expect("agents")
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, ["codex", "opus"]);

    registry.remove("opus").await.expect("remove");
    assert!(registry.load("opus").await.expect("load").is_none());
    assert!(registry.load("codex").await.expect("load").is_some());
}
