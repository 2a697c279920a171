//! File-backed coordination store shared by independent connections.

use chrono::Utc;

use duo_relay::models::Workspace;
use duo_relay::persistence::Store;

#[tokio::test]
async fn value_written_by_one_pool_is_read_by_another() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("duo-acme-widgets-7.db");

    let writer = Store::open(&path, 5).await.expect("open writer");
    writer.state.set("duo:7", "stage", "3").await.expect("set");

    let reader = Store::open(&path, 5).await.expect("open reader");
    assert_eq!(
        reader.state.get("duo:7", "stage").await.expect("get").as_deref(),
        Some("3")
    );
}

#[tokio::test]
async fn reopening_keeps_schema_and_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("duo.db");
    let ws = Workspace::new("acme/widgets", "7");

    {
        let store = Store::open(&path, 5).await.expect("first open");
        store
            .messages
            .append(&ws, "a", "b", "persisted", Utc::now())
            .await
            .expect("append");
    }

    let store = Store::open(&path, 5).await.expect("second open");
    let messages = store.messages.list(&ws, None, None).await.expect("list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "persisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_appends_from_many_pools_are_all_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("duo.db");
    let ws = Workspace::new("acme/widgets", "7");
    // Create the schema once so writers only contend on inserts.
    drop(Store::open(&path, 5).await.expect("bootstrap"));

    let mut tasks = Vec::new();
    for writer in 0..4 {
        let path = path.clone();
        let ws = ws.clone();
        tasks.push(tokio::spawn(async move {
            let store = Store::open(&path, 10).await.expect("open");
            for i in 0..25 {
                store
                    .messages
                    .append(&ws, &format!("w{writer}"), "hub", &format!("{i}"), Utc::now())
                    .await
                    .expect("append");
            }
        }));
    }
    for task in tasks {
        task.await.expect("writer task");
    }

    let store = Store::open(&path, 5).await.expect("open");
    let all = store.messages.list(&ws, None, None).await.expect("list");
    assert_eq!(all.len(), 100);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));

    let last = store.messages.list(&ws, Some("w2"), Some(5)).await.expect("list");
    let contents: Vec<_> = last.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["20", "21", "22", "23", "24"]);
}
