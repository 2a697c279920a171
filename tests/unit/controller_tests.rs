//! Unit tests for controller operations that need no running daemon.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use duo_relay::config::GlobalConfig;
use duo_relay::controller::Controller;
use duo_relay::models::{SessionRecord, Workspace};
use duo_relay::persistence::Store;
use duo_relay::AppError;

async fn controller_with_log(log_path: &Path) -> Controller {
    let store = Store::open_memory(3).await.expect("memory store");
    let controller = Controller::with_store(
        GlobalConfig::default(),
        Workspace::new("acme/widgets", "7"),
        store,
    );
    let record = SessionRecord {
        name: "opus".into(),
        session_id: "sess-opus".into(),
        model: None,
        workspace: "acme-widgets-7".into(),
        cwd: log_path.parent().expect("log dir").to_path_buf(),
        pid: 0,
        fifo_path: log_path.with_extension("fifo"),
        log_path: log_path.to_path_buf(),
    };
    controller.registry().record(&record).await.expect("record");
    controller
}

async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("line within deadline")
        .expect("follower still running")
}

#[tokio::test]
async fn logs_returns_the_last_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("duo-acme-widgets-7-opus.log");
    std::fs::write(&log, "a\nb\nc\n").expect("write log");
    let controller = controller_with_log(&log).await;

    assert_eq!(controller.logs("opus", Some(2)).await.expect("logs"), ["b", "c"]);
    assert_eq!(controller.logs("opus", None).await.expect("logs").len(), 3);
}

#[tokio::test]
async fn follow_emits_backlog_then_appended_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("duo-acme-widgets-7-opus.log");
    std::fs::write(&log, "a\nb\nc\n").expect("write log");
    let controller = controller_with_log(&log).await;

    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let follow = controller.follow_logs("opus", Some(2), &stop, move |line| {
        let _ = tx.send(line.to_owned());
    });

    let drive = async {
        assert_eq!(next_line(&mut rx).await, "b");
        assert_eq!(next_line(&mut rx).await, "c");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .expect("open log");
        file.write_all(b"d\npart").expect("append");
        assert_eq!(next_line(&mut rx).await, "d");

        file.write_all(b"ial\n").expect("finish line");
        assert_eq!(next_line(&mut rx).await, "partial");
        stop.cancel();
    };

    let (result, ()) = tokio::join!(follow, drive);
    result.expect("follow ends cleanly when stopped");
}

#[tokio::test]
async fn follow_unknown_agent_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = controller_with_log(&dir.path().join("opus.log")).await;

    let stop = CancellationToken::new();
    let err = controller
        .follow_logs("ghost", None, &stop, |_| {})
        .await
        .expect_err("nothing recorded");
    assert!(matches!(err, AppError::NotFound(_)));
}
