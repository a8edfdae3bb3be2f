/// Contract tests: literal JSON for each wire shape, deserialized to Rust
/// types, serialized back, and compared structurally so the frozen field
/// names and discriminators cannot drift.
use loghub_protocol::{
    ClientFrame, Level, LogRecord, OverflowPolicy, QueryFilter, RecordDraft, RpcRequest,
    RpcResponse, ServerFrame, Since,
};

/// Round-trip `json_text` through `T` and assert structural equality.
fn round_trip<T>(json_text: &str) -> T
where
    T: serde::de::DeserializeOwned + serde::Serialize,
{
    let value: T = serde_json::from_str(json_text)
        .unwrap_or_else(|e| panic!("failed to deserialize: {e}\nJSON: {json_text}"));
    let serialized = serde_json::to_string(&value).expect("serialize");
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch");
    value
}

#[test]
fn log_record_round_trip() {
    let record: LogRecord = round_trip(
        r#"{
            "id": 17,
            "timestamp": "2026-02-03T10:15:30.250Z",
            "level": "ERROR",
            "source": "mcp_calls",
            "message": "tool invocation failed",
            "metadata": {"method": "tools/call", "duration_ms": 153},
            "tags": ["collector:mcp_calls"],
            "trace_id": "req-0042"
        }"#,
    );
    assert_eq!(record.id, 17);
    assert_eq!(record.level, Level::Error);
    assert_eq!(record.trace_id.as_deref(), Some("req-0042"));
    assert_eq!(record.timestamp_rfc3339(), "2026-02-03T10:15:30.250Z");
}

#[test]
fn record_draft_minimal_and_full_round_trip() {
    let minimal: RecordDraft =
        round_trip(r#"{"level":"INFO","source":"auth","message":"login"}"#);
    assert!(minimal.timestamp.is_none());
    assert!(minimal.metadata.is_empty());

    let full: RecordDraft = round_trip(
        r#"{
            "timestamp": "2026-02-03T10:15:30.000Z",
            "level": "WARN",
            "source": "websocket",
            "message": "slow frame",
            "metadata": {"password": "hunter2", "user": "alice"},
            "tags": ["session:9"],
            "trace_id": "ws-9"
        }"#,
    );
    assert!(full.timestamp.is_some());
    assert_eq!(full.metadata.len(), 2);
}

#[test]
fn query_filter_round_trip() {
    let filter: QueryFilter = round_trip(
        r#"{
            "sources": ["http_requests"],
            "levels": ["ERROR", "FATAL"],
            "min_level": "WARN",
            "since": "1h",
            "until": "2026-02-03T12:00:00.000Z",
            "trace_id": "req-1",
            "tags": ["slow"],
            "text": "timeout",
            "limit": 50,
            "offset": 100,
            "order": "asc"
        }"#,
    );
    assert_eq!(filter.levels, vec![Level::Error, Level::Fatal]);
    assert_eq!(filter.limit, Some(50));
}

#[test]
fn subscribe_frame_round_trip_with_both_since_forms() {
    let by_time: ClientFrame = round_trip(
        r#"{
            "action": "subscribe",
            "id": "sub-1",
            "filter": {"min_level": "WARN", "sources": ["ai_analysis"]},
            "since": "15m",
            "replay_limit": 200,
            "overflow": "close"
        }"#,
    );
    match by_time {
        ClientFrame::Subscribe {
            since, overflow, ..
        } => {
            assert!(matches!(since, Some(Since::Time(_))));
            assert_eq!(overflow, Some(OverflowPolicy::Close));
        }
        other => panic!("expected subscribe, got {other:?}"),
    }

    let by_id: ClientFrame =
        round_trip(r#"{"action":"subscribe","id":"sub-2","since":1024}"#);
    match by_id {
        ClientFrame::Subscribe { since, .. } => assert_eq!(since, Some(Since::LastId(1024))),
        other => panic!("expected subscribe, got {other:?}"),
    }
}

#[test]
fn server_frames_round_trip() {
    let live: ServerFrame = round_trip(r#"{"type":"live"}"#);
    assert_eq!(live, ServerFrame::Live);

    let dropped: ServerFrame = round_trip(r#"{"type":"dropped","count":6}"#);
    assert_eq!(dropped, ServerFrame::Dropped { count: 6 });

    let error: ServerFrame =
        round_trip(r#"{"type":"error","code":-32002,"message":"busy"}"#);
    match error {
        ServerFrame::Error { code, .. } => assert_eq!(code, -32002),
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[test]
fn rpc_envelope_round_trip() {
    let request: RpcRequest = round_trip(
        r#"{
            "jsonrpc": "2.0",
            "method": "log.query",
            "params": {"min_level": "WARN", "limit": 10},
            "id": 1
        }"#,
    );
    assert_eq!(request.method, "log.query");

    let response: RpcResponse = round_trip(
        r#"{
            "jsonrpc": "2.0",
            "error": {"code": -32004, "message": "cancelled"},
            "id": 1
        }"#,
    );
    assert_eq!(response.error.expect("error").code, -32004);
}
