/// Live stream behavior over a real WebSocket connection.
///
/// Validates:
/// - subscribe → `live` marker → matching records pushed as frames
/// - replay from `last_id` delivers history then live with no duplicates
/// - subscription filters apply per subscriber
/// - unsubscribe stops delivery
/// - application-level ping/pong
use futures_util::{SinkExt, StreamExt};
use loghub::config::Config;
use loghub::{build_router, build_service, Service};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server() -> (String, String, Service, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = Config::default();
    cfg.storage.db_path = dir.path().join("logs.db");
    cfg.storage.dead_letter_path = dir.path().join("dead-letter.ndjson");

    let service = build_service(cfg).await.expect("build service");
    let router = build_router(service.state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("http://{addr}"), format!("ws://{addr}/ws"), service, dir)
}

async fn connect(ws_url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .expect("ws connect");
    stream
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON frame, skipping protocol-level ping/pong.
async fn next_frame(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket open")
            .expect("frame ok");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("frame json")
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }
}

async fn write_record(base: &str, source: &str, level: &str, message: &str) -> u64 {
    let response: Value = reqwest::Client::new()
        .post(format!("{base}/rpc"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "log.write",
            "params": {"level": level, "source": source, "message": message},
            "id": 1
        }))
        .send()
        .await
        .expect("rpc send")
        .json()
        .await
        .expect("rpc json");
    assert!(
        response.get("error").is_none(),
        "write failed: {response}"
    );
    response["result"]["id"].as_u64().expect("id")
}

#[tokio::test]
async fn subscribe_then_receive_matching_records_live() {
    let (base, ws_url, _service, _dir) = start_server().await;
    let mut ws = connect(&ws_url).await;

    send_json(
        &mut ws,
        json!({"action": "subscribe", "id": "s1", "filter": {"sources": ["auth"]}}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "live");

    write_record(&base, "auth", "INFO", "login ok").await;
    // A record for another source must not arrive on this subscription.
    write_record(&base, "other", "INFO", "invisible").await;

    let frame = next_frame(&mut ws).await;
    let record = match frame["type"].as_str() {
        Some("record") => frame["record"].clone(),
        Some("batch") => frame["records"][0].clone(),
        other => panic!("expected record frame, got {other:?}: {frame}"),
    };
    assert_eq!(record["source"], "auth");
    assert_eq!(record["message"], "login ok");

    // Nothing else is queued for this subscriber.
    send_json(&mut ws, json!({"action": "ping"})).await;
    assert_eq!(next_frame(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn replay_from_last_id_then_live_without_duplicates() {
    let (base, ws_url, _service, _dir) = start_server().await;

    let first = write_record(&base, "replay", "INFO", "one").await;
    let second = write_record(&base, "replay", "INFO", "two").await;
    let third = write_record(&base, "replay", "INFO", "three").await;

    let mut ws = connect(&ws_url).await;
    send_json(
        &mut ws,
        json!({
            "action": "subscribe",
            "id": "r1",
            "filter": {"sources": ["replay"]},
            "since": first
        }),
    )
    .await;

    // History strictly after `first`, oldest first, then the live marker.
    let mut received: Vec<u64> = Vec::new();
    loop {
        let frame = next_frame(&mut ws).await;
        match frame["type"].as_str() {
            Some("batch") => {
                for record in frame["records"].as_array().expect("records") {
                    received.push(record["id"].as_u64().expect("id"));
                }
            }
            Some("record") => received.push(frame["record"]["id"].as_u64().expect("id")),
            Some("live") => break,
            other => panic!("unexpected frame {other:?}: {frame}"),
        }
    }
    assert_eq!(received, vec![second, third]);

    let fourth = write_record(&base, "replay", "INFO", "four").await;
    let frame = next_frame(&mut ws).await;
    let live_id = match frame["type"].as_str() {
        Some("record") => frame["record"]["id"].as_u64().expect("id"),
        Some("batch") => frame["records"][0]["id"].as_u64().expect("id"),
        other => panic!("expected record frame, got {other:?}"),
    };
    assert_eq!(live_id, fourth);
    received.push(live_id);

    // No duplicates and no omissions across the transition.
    let mut sorted = received.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), received.len());
    assert_eq!(received, vec![second, third, fourth]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (base, ws_url, _service, _dir) = start_server().await;
    let mut ws = connect(&ws_url).await;

    send_json(
        &mut ws,
        json!({"action": "subscribe", "id": "u1", "filter": {"sources": ["gone"]}}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "live");

    send_json(&mut ws, json!({"action": "unsubscribe", "id": "u1"})).await;
    // Give the unsubscribe a moment to land before writing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_record(&base, "gone", "INFO", "after unsubscribe").await;

    // Only the pong should come back; no record frame precedes it.
    send_json(&mut ws, json!({"action": "ping"})).await;
    assert_eq!(next_frame(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn unknown_subscription_and_bad_frames_report_errors() {
    let (_base, ws_url, _service, _dir) = start_server().await;
    let mut ws = connect(&ws_url).await;

    send_json(&mut ws, json!({"action": "unsubscribe", "id": "nope"})).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], -32001);

    ws.send(Message::Text("{not json".into()))
        .await
        .expect("send");
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], -32600);
}

#[tokio::test]
async fn duplicate_subscription_ids_are_rejected_across_connections() {
    let (_base, ws_url, _service, _dir) = start_server().await;
    let mut first = connect(&ws_url).await;
    send_json(
        &mut first,
        json!({"action": "subscribe", "id": "shared", "filter": {}}),
    )
    .await;
    assert_eq!(next_frame(&mut first).await["type"], "live");

    let mut second = connect(&ws_url).await;
    send_json(
        &mut second,
        json!({"action": "subscribe", "id": "shared", "filter": {}}),
    )
    .await;
    let frame = next_frame(&mut second).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], -32602);
}

#[tokio::test]
async fn dropped_transport_resumes_within_the_grace_window() {
    let (base, ws_url, service, _dir) = start_server().await;

    let mut ws = connect(&ws_url).await;
    send_json(
        &mut ws,
        json!({"action": "subscribe", "id": "g1", "filter": {"sources": ["grace"]}}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "live");
    drop(ws);

    // Let the session notice the dropped transport and park the
    // subscription in its grace window (it stays registered).
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(service.state.broker.subscriber_count().await, 1);

    // Records written while disconnected accrue in the grace buffer.
    let missed = write_record(&base, "grace", "INFO", "while away").await;

    let mut ws = connect(&ws_url).await;
    send_json(
        &mut ws,
        json!({"action": "subscribe", "id": "g1", "filter": {"sources": ["grace"]}}),
    )
    .await;
    // Resume: live marker, then the buffered record without re-replay.
    assert_eq!(next_frame(&mut ws).await["type"], "live");
    let frame = next_frame(&mut ws).await;
    let id = match frame["type"].as_str() {
        Some("record") => frame["record"]["id"].as_u64().expect("id"),
        Some("batch") => frame["records"][0]["id"].as_u64().expect("id"),
        other => panic!("expected buffered record, got {other:?}"),
    };
    assert_eq!(id, missed);
}
