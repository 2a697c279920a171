//! Unit tests for handshake envelopes and readiness detection.

use duo_relay::protocol::handshake::{
    build_request, inspect_line, is_ready, is_rejection, HandshakeMode, HandshakeSignal,
};

fn new_mode() -> HandshakeMode {
    HandshakeMode::New {
        model: "claude-opus-4-5-20251101".into(),
        machine_id: "build-host".into(),
        cwd: "/work/repo".into(),
    }
}

fn resume_mode() -> HandshakeMode {
    HandshakeMode::Resume {
        session_id: "sess-42".into(),
    }
}

// ── Request envelopes ───────────────────────────────────────────────────────

#[test]
fn new_request_carries_identity_cwd_and_model() {
    let req = build_request(&new_mode());

    assert_eq!(req["jsonrpc"], "2.0");
    assert_eq!(req["type"], "request");
    assert_eq!(req["factoryApiVersion"], "1.0.0");
    assert_eq!(req["method"], "droid.initialize_session");
    assert_eq!(req["id"], "init");
    assert_eq!(req["params"]["machineId"], "build-host");
    assert_eq!(req["params"]["cwd"], "/work/repo");
    assert_eq!(req["params"]["modelId"], "claude-opus-4-5-20251101");
}

#[test]
fn new_request_without_model_omits_model_field() {
    let mode = HandshakeMode::New {
        model: String::new(),
        machine_id: "h".into(),
        cwd: "/".into(),
    };
    let req = build_request(&mode);
    assert!(req["params"].get("modelId").is_none());
}

#[test]
fn resume_request_carries_only_session_id() {
    let req = build_request(&resume_mode());

    assert_eq!(req["method"], "droid.load_session");
    assert_eq!(req["id"], "load");
    let params = req["params"].as_object().expect("params object");
    assert_eq!(params.len(), 1);
    assert_eq!(params["sessionId"], "sess-42");
}

#[test]
fn request_serialises_to_a_single_line() {
    let line = serde_json::to_string(&build_request(&new_mode())).expect("serialise");
    assert!(!line.contains('\n'));
}

// ── Readiness: new session ──────────────────────────────────────────────────

#[test]
fn new_session_ready_on_top_level_session_id() {
    let line = r#"{"type":"response","id":"init","result":{"sessionId":"abc"}}"#;
    assert!(is_ready(line, &new_mode()));
    assert_eq!(
        inspect_line(line, &new_mode()),
        HandshakeSignal::Ready(Some("abc".into()))
    );
}

#[test]
fn new_session_ready_on_any_line_naming_a_session() {
    let line = r#"{"type":"notification","method":"droid.session_notification","params":{"sessionId":"abc"}}"#;
    assert!(is_ready(line, &new_mode()));
}

#[test]
fn new_session_not_ready_on_plain_text() {
    assert!(!is_ready("Starting droid...", &new_mode()));
    assert!(!is_ready("", &new_mode()));
    assert!(!is_ready("{not json", &new_mode()));
}

#[test]
fn new_session_not_ready_on_text_mentioning_session_id() {
    assert!(!is_ready(r#"log: "sessionId" will follow"#, &new_mode()));
}

#[test]
fn new_session_not_ready_on_unrelated_envelope() {
    let line = r#"{"type":"notification","method":"droid.working_state","params":{"state":"idle"}}"#;
    assert!(!is_ready(line, &new_mode()));
}

// ── Readiness: resume ───────────────────────────────────────────────────────

#[test]
fn resume_ready_on_load_response_with_session_object() {
    let line = r#"{"type":"response","id":"load","result":{"session":{"id":"sess-42","messages":[]}}}"#;
    assert!(is_ready(line, &resume_mode()));
    assert_eq!(
        inspect_line(line, &resume_mode()),
        HandshakeSignal::Ready(Some("sess-42".into()))
    );
}

#[test]
fn resume_not_ready_on_wrong_id() {
    let line = r#"{"type":"response","id":"init","result":{"session":{"id":"sess-42"}}}"#;
    assert!(!is_ready(line, &resume_mode()));
}

#[test]
fn resume_not_ready_when_session_is_not_an_object() {
    let line = r#"{"type":"response","id":"load","result":{"session":"sess-42"}}"#;
    assert!(!is_ready(line, &resume_mode()));
}

#[test]
fn resume_ignores_bare_session_id_lines() {
    let line = r#"{"params":{"sessionId":"sess-42"}}"#;
    assert!(!is_ready(line, &resume_mode()));
}

// ── Rejection ───────────────────────────────────────────────────────────────

#[test]
fn error_response_with_matching_id_is_a_rejection() {
    let line = r#"{"type":"response","id":"init","error":{"code":-32000,"message":"unknown model"}}"#;
    assert!(is_rejection(line, &new_mode()));
    assert_eq!(
        inspect_line(line, &new_mode()),
        HandshakeSignal::Rejected("unknown model".into())
    );
}

#[test]
fn error_response_for_other_request_is_ignored() {
    let line = r#"{"type":"response","id":"other","error":{"message":"nope"}}"#;
    assert!(!is_rejection(line, &new_mode()));
    assert!(!is_rejection(line, &resume_mode()));
}
