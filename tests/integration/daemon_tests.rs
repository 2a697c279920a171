//! In-process tests of the session daemon against the fake agent.

use std::time::Duration;

use serial_test::serial;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use duo_relay::daemon::{run_daemon, DaemonOutcome};
use duo_relay::protocol::control;
use duo_relay::protocol::handshake::HandshakeMode;
use duo_relay::transport::fifo::{self, FifoSender};
use duo_relay::AppError;

use super::test_helpers::{
    agent_pid, daemon_options, echoed_lines, new_handshake, raw_pipe_writer, wait_for_file,
    FLOOD_LINES,
};

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn forwards_lines_in_order_and_logs_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "echo", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(run_daemon(opts, shutdown.clone()));

    // Two writer sessions, each with several lines.
    for session in 0..2 {
        let mut sender = FifoSender::connect(&fifo_path, Duration::from_secs(10))
            .await
            .expect("daemon attaches to the pipe");
        for i in 0..5 {
            sender.send_line(&format!("msg-{session}-{i}")).await.expect("send");
        }
        sender.send_line("   ").await.expect("blank line");
    }

    let log = wait_for_file(&log_path, Duration::from_secs(10), |text| {
        text.contains("echo: msg-1-4")
    })
    .await;

    let echoed: Vec<_> = log
        .lines()
        .filter_map(|l| l.strip_prefix("echo: "))
        .collect();
    let expected: Vec<String> = (0..2)
        .flat_map(|s| (0..5).map(move |i| format!("msg-{s}-{i}")))
        .collect();
    assert_eq!(echoed, expected, "blank lines are not forwarded");
    assert!(log.contains("fake agent booting"), "handshake output is logged");
    assert!(log.contains("\"sessionId\":\"sess-"), "ready line is logged");

    shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon stops")
        .expect("join")
        .expect("daemon result");
    assert_eq!(outcome, DaemonOutcome::Shutdown);
    assert!(!fifo_path.exists(), "pipe is removed on exit");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn oversized_pipe_line_is_dropped_entirely() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "echo", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(run_daemon(opts, shutdown.clone()));

    let mut writer = raw_pipe_writer(&fifo_path).await;
    writer.write_all(b"before\n").await.expect("write");
    writer
        .write_all(&vec![b'A'; 2 * 1024 * 1024])
        .await
        .expect("write oversized line");
    writer.write_all(b"\nafter-1\nafter-2\n").await.expect("write");
    drop(writer);

    let mut second = FifoSender::connect(&fifo_path, Duration::from_secs(10))
        .await
        .expect("second writer");
    second.send_line("second-writer").await.expect("send");
    drop(second);

    let log = wait_for_file(&log_path, Duration::from_secs(15), |t| {
        t.contains("echo: second-writer")
    })
    .await;
    assert_eq!(
        echoed_lines(&log),
        ["before", "after-1", "after-2", "second-writer"]
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon stops")
        .expect("join")
        .expect("daemon result");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn invalid_utf8_drops_only_that_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "echo", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(run_daemon(opts, shutdown.clone()));

    let mut writer = raw_pipe_writer(&fifo_path).await;
    writer
        .write_all(b"one\n\xff\xfe bad\ntwo\nthree\n")
        .await
        .expect("write");
    drop(writer);

    let log = wait_for_file(&log_path, Duration::from_secs(10), |t| t.contains("echo: three")).await;
    assert_eq!(echoed_lines(&log), ["one", "two", "three"]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon stops")
        .expect("join")
        .expect("daemon result");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn chatty_agent_is_drained_without_deadlock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "flood", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        run_daemon(opts, CancellationToken::new()),
    )
    .await
    .expect("daemon must not deadlock")
    .expect("daemon result");

    assert_eq!(outcome, DaemonOutcome::ChildExited { code: Some(0) });
    let log = std::fs::read_to_string(&log_path).expect("log");
    let flood = log.lines().filter(|l| l.starts_with("flood ")).count();
    assert_eq!(flood, FLOOD_LINES);
    assert!(log.contains(&format!("flood {} ", FLOOD_LINES - 1)));
    assert!(!fifo_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn agent_exit_ends_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "echo", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let daemon = tokio::spawn(run_daemon(opts, CancellationToken::new()));
    wait_for_file(&log_path, Duration::from_secs(10), |t| t.contains("sessionId")).await;

    let pid = nix::unistd::Pid::from_raw(agent_pid(dir.path()));
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).expect("kill agent");

    let outcome = tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon notices exit while waiting for a writer")
        .expect("join")
        .expect("daemon result");
    assert_eq!(outcome, DaemonOutcome::ChildExited { code: None });
    assert!(!fifo_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn resume_handshake_uses_load_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mode = HandshakeMode::Resume {
        session_id: "sess-resumed".into(),
    };
    let opts = daemon_options(dir.path(), "echo", mode);
    let fifo_path = opts.fifo_path.clone();
    let log_path = opts.log_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(run_daemon(opts, shutdown.clone()));

    fifo::send_envelope(
        &fifo_path,
        &control::interrupt_session(),
        Duration::from_secs(10),
    )
    .await
    .expect("send interrupt");

    let log = wait_for_file(&log_path, Duration::from_secs(10), |t| {
        t.contains("droid.interrupt_session")
    })
    .await;
    assert!(log.contains(r#""id":"load""#));
    assert!(log.contains(r#""id":"sess-resumed""#));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon stops")
        .expect("join")
        .expect("daemon result");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn error_answer_rejects_handshake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "reject", new_handshake(dir.path()));
    let fifo_path = opts.fifo_path.clone();
    fifo::prepare(&fifo_path).expect("mkfifo");

    let err = run_daemon(opts, CancellationToken::new())
        .await
        .expect_err("handshake must fail");
    assert!(matches!(err, AppError::HandshakeRejected(ref msg) if msg.contains("unknown model")));
    assert!(!fifo_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn agent_exit_before_ready_rejects_handshake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = daemon_options(dir.path(), "crash", new_handshake(dir.path()));
    let log_path = opts.log_path.clone();
    fifo::prepare(&opts.fifo_path).expect("mkfifo");

    let err = run_daemon(opts, CancellationToken::new())
        .await
        .expect_err("handshake must fail");
    assert!(matches!(err, AppError::HandshakeRejected(_)));

    let log = std::fs::read_to_string(log_path).expect("log");
    assert!(log.contains("fatal: no credentials"), "agent stderr goes to the log");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn silent_agent_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut opts = daemon_options(dir.path(), "silent", new_handshake(dir.path()));
    opts.handshake_timeout = Duration::from_millis(500);
    fifo::prepare(&opts.fifo_path).expect("mkfifo");

    let started = std::time::Instant::now();
    let err = run_daemon(opts, CancellationToken::new())
        .await
        .expect_err("handshake must time out");
    assert!(matches!(err, AppError::HandshakeTimeout(_)));
    assert!(started.elapsed() < Duration::from_secs(8), "agent is stopped promptly");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn missing_agent_binary_is_a_launch_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut opts = daemon_options(dir.path(), "echo", new_handshake(dir.path()));
    opts.command.agent_cli = dir.path().join("no-such-agent").to_string_lossy().into_owned();

    let err = run_daemon(opts, CancellationToken::new())
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, AppError::Launch(_)));
}
