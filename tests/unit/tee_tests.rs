//! Unit tests for the session transcript writer and output drain.

use std::io::Cursor;

use duo_relay::protocol::codec::{Chunk, MAX_LINE_BYTES};
use duo_relay::transport::tee::{spawn_drain, LogTee};

#[tokio::test]
async fn drain_copies_output_verbatim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.log");
    let tee = LogTee::open(&path).expect("open log");

    let output = b"first\nsecond\nno newline".to_vec();
    let lines = spawn_drain("opus".into(), Cursor::new(output), tee)
        .await
        .expect("drain task");

    assert_eq!(lines, 3);
    let log = std::fs::read_to_string(&path).expect("read log");
    assert_eq!(log, "first\nsecond\nno newline\n");
}

#[tokio::test]
async fn oversized_output_line_is_logged_whole() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.log");
    let tee = LogTee::open(&path).expect("open log");

    let big = "B".repeat(MAX_LINE_BYTES * 2 + 17);
    let output = format!("start\n{big}\nend\n").into_bytes();
    let lines = spawn_drain("opus".into(), Cursor::new(output), tee)
        .await
        .expect("drain task");

    // The oversized line is not counted as a line of its own.
    assert_eq!(lines, 2);
    let log = std::fs::read_to_string(&path).expect("read log");
    let logged: Vec<&str> = log.lines().collect();
    assert_eq!(logged.len(), 3);
    assert_eq!(logged[0], "start");
    assert_eq!(logged[1].len(), big.len());
    assert_eq!(logged[2], "end");
}

#[tokio::test]
async fn unterminated_oversized_output_is_closed_at_eof() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.log");
    let mut tee = LogTee::open(&path).expect("open log");

    assert_eq!(tee.append(b"AAAA", Chunk::Fragment).await.expect("append"), Chunk::Fragment);
    assert_eq!(tee.append(b"", Chunk::Eof).await.expect("append"), Chunk::Eof);
    assert_eq!(tee.append(b"next\n", Chunk::Line).await.expect("append"), Chunk::Line);

    let log = std::fs::read_to_string(&path).expect("read log");
    assert_eq!(log, "AAAA\nnext\n");
}

#[tokio::test]
async fn tail_of_oversized_line_is_not_reported_as_a_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.log");
    let mut tee = LogTee::open(&path).expect("open log");

    tee.append(b"{\"partial\":", Chunk::Fragment).await.expect("append");
    let tail = tee
        .append(b"\"sessionId\":\"x\"}\n", Chunk::Line)
        .await
        .expect("append");
    assert_eq!(tail, Chunk::Fragment);
}
