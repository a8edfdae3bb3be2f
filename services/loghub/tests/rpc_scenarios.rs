/// End-to-end JSON-RPC scenarios against a live server on an ephemeral port.
///
/// Covers the contract examples: redaction on write, min_level filtering,
/// FTS highlighting, stats buckets, plus status/health/toggle and the
/// error-code table.
use loghub::config::Config;
use loghub::{build_router, build_service, Service};
use serde_json::{json, Value};
use tempfile::TempDir;

async fn start_server(mutate: impl FnOnce(&mut Config)) -> (String, Service, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = Config::default();
    cfg.storage.db_path = dir.path().join("logs.db");
    cfg.storage.dead_letter_path = dir.path().join("dead-letter.ndjson");
    mutate(&mut cfg);

    let service = build_service(cfg).await.expect("build service");
    let router = build_router(service.state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("http://{addr}"), service, dir)
}

async fn rpc(base: &str, method: &str, params: Value) -> Value {
    let response = reqwest::Client::new()
        .post(format!("{base}/rpc"))
        .json(&json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1}))
        .send()
        .await
        .expect("rpc send");
    response.json().await.expect("rpc json")
}

fn result(response: &Value) -> &Value {
    assert!(
        response.get("error").is_none(),
        "unexpected rpc error: {response}"
    );
    &response["result"]
}

#[tokio::test]
async fn write_redacts_sensitive_metadata_before_persisting() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    let written = rpc(
        &base,
        "log.write",
        json!({
            "level": "INFO",
            "source": "auth",
            "message": "login",
            "metadata": {"user": "alice", "password": "hunter2"}
        }),
    )
    .await;
    let id = result(&written)["id"].as_u64().expect("id");
    assert!(id > 0);

    let queried = rpc(&base, "log.query", json!({"text": "login", "limit": 1})).await;
    let logs = result(&queried)["logs"].as_array().expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["metadata"]["password"], "[REDACTED]");
    assert_eq!(logs[0]["metadata"]["user"], "alice");
    // The cleartext secret never reaches storage in any field.
    let dump = serde_json::to_string(&logs[0]).expect("dump");
    assert!(!dump.contains("hunter2"));
}

#[tokio::test]
async fn min_level_filters_by_severity_threshold() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    for (level, message) in [("DEBUG", "d"), ("INFO", "i"), ("ERROR", "e")] {
        let written = rpc(
            &base,
            "log.write",
            json!({"level": level, "source": "mix", "message": message}),
        )
        .await;
        assert!(result(&written)["id"].as_u64().expect("id") > 0);
    }

    let queried = rpc(
        &base,
        "log.query",
        json!({"sources": ["mix"], "min_level": "WARN"}),
    )
    .await;
    let body = result(&queried);
    assert_eq!(body["total_matches"], 1);
    assert_eq!(body["logs"][0]["level"], "ERROR");
}

#[tokio::test]
async fn search_highlights_the_matched_span() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    rpc(
        &base,
        "log.write",
        json!({
            "level": "ERROR",
            "source": "http_requests",
            "message": "Payment service timed out after 500ms"
        }),
    )
    .await;

    let searched = rpc(
        &base,
        "log.search",
        json!({"query": "timed out", "highlight": true}),
    )
    .await;
    let body = result(&searched);
    assert_eq!(body["total_matches"], 1);
    let highlights = body["highlights"].as_array().expect("highlights");
    assert_eq!(highlights.len(), 1);
    let fragment = highlights[0]["highlighted_text"].as_str().expect("text");
    assert!(fragment.contains("<mark>timed out</mark>"), "got: {fragment}");
    assert!(body["search_time_ms"].is_u64());
}

#[tokio::test]
async fn stats_bucket_six_records_over_a_minute() {
    // Keep every collector stopped so the service's own request records do
    // not land in the counted window.
    let (base, _service, _dir) = start_server(|cfg| {
        cfg.collectors.enabled = Vec::new();
    })
    .await;

    // 6 records spaced 10 s apart over the last minute, half ERROR half INFO.
    let start = chrono::Utc::now() - chrono::Duration::seconds(55);
    for i in 0..6 {
        let ts = start + chrono::Duration::seconds(i * 10);
        let level = if i % 2 == 0 { "ERROR" } else { "INFO" };
        rpc(
            &base,
            "log.write",
            json!({
                "timestamp": ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "level": level,
                "source": "spread",
                "message": format!("sample {i}")
            }),
        )
        .await;
    }

    let stats = rpc(&base, "log.stats", json!({"timerange": "1h"})).await;
    let body = result(&stats);
    assert_eq!(body["total_logs"], 6);
    assert!((body["error_rate"].as_f64().expect("rate") - 0.5).abs() < 1e-9);
    let buckets = body["time_distribution"].as_array().expect("buckets");
    let sum: u64 = buckets
        .iter()
        .map(|b| b["count"].as_u64().expect("count"))
        .sum();
    assert_eq!(sum, 6);
    // 1h range → 1-minute buckets; 6 records over ~1 min span at most 2.
    let non_empty = buckets.iter().filter(|b| b["count"].as_u64() != Some(0)).count();
    assert!(non_empty <= 2, "expected 1-minute buckets, got {non_empty} non-empty");
}

#[tokio::test]
async fn status_and_health_report_collectors_and_storage() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    rpc(
        &base,
        "log.write",
        json!({"level": "INFO", "source": "auth", "message": "warm-up"}),
    )
    .await;

    let status = rpc(&base, "system.status", json!({})).await;
    let body = result(&status);
    assert_eq!(body["server_status"], "running");
    assert!(body["total_logs"].as_u64().expect("total") >= 1);
    let collectors = body["collectors"].as_object().expect("collectors");
    for name in ["mcp_calls", "websocket", "ai_analysis", "http_requests"] {
        assert!(collectors.contains_key(name), "missing collector {name}");
    }
    // The RPC collector observed these very calls.
    assert!(
        collectors["mcp_calls"]["counters"]["requests"]
            .as_u64()
            .expect("requests")
            >= 1
    );

    let health = rpc(&base, "system.health", json!({})).await;
    let body = result(&health);
    assert_eq!(body["ok"], true);
    let checks = body["checks"].as_array().expect("checks");
    assert!(checks.iter().any(|c| c["name"] == "storage"));
}

#[tokio::test]
async fn toggle_stops_and_restarts_a_collector() {
    let (base, service, _dir) = start_server(|_| {}).await;

    let toggled = rpc(
        &base,
        "collector.toggle",
        json!({"name": "websocket", "enabled": false}),
    )
    .await;
    assert_eq!(result(&toggled)["enabled"], false);

    // Wait for the stop to land.
    for _ in 0..100 {
        let status = service.state.collectors.status();
        if status["websocket"].state == loghub_protocol::CollectorState::Stopped {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        service.state.collectors.status()["websocket"].state,
        loghub_protocol::CollectorState::Stopped
    );

    let unknown = rpc(
        &base,
        "collector.toggle",
        json!({"name": "nonexistent", "enabled": true}),
    )
    .await;
    assert_eq!(unknown["error"]["code"], -32001);
}

#[tokio::test]
async fn update_config_patches_a_collector() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    let ok = rpc(
        &base,
        "collector.updateConfig",
        json!({"name": "websocket", "patch": {"log_messages": true}}),
    )
    .await;
    assert_eq!(result(&ok)["updated"], true);

    let rejected = rpc(
        &base,
        "collector.updateConfig",
        json!({"name": "websocket", "patch": {"bogus": 1}}),
    )
    .await;
    assert_eq!(rejected["error"]["code"], -32602);
}

#[tokio::test]
async fn write_batch_reports_written_and_dropped() {
    let (base, _service, _dir) = start_server(|cfg| {
        cfg.filter.drop_patterns = vec!["noisy".to_owned()];
    })
    .await;

    let batch = rpc(
        &base,
        "log.writeBatch",
        json!({"records": [
            {"level": "INFO", "source": "a", "message": "kept one"},
            {"level": "DEBUG", "source": "a", "message": "noisy heartbeat"},
            {"level": "WARN", "source": "b", "message": "kept two"}
        ]}),
    )
    .await;
    let body = result(&batch);
    assert_eq!(body["written"], 2);
    assert_eq!(body["dropped"], 1);
    assert_eq!(body["ids"].as_array().expect("ids").len(), 2);
}

#[tokio::test]
async fn compressed_write_batch_round_trips() {
    use base64::Engine as _;
    use flate2::write::GzEncoder;
    use std::io::Write as _;

    let (base, _service, _dir) = start_server(|_| {}).await;

    let records = json!([
        {"level": "INFO", "source": "bulk", "message": "compressed one"},
        {"level": "INFO", "source": "bulk", "message": "compressed two"}
    ]);
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(records.to_string().as_bytes())
        .expect("gzip write");
    let blob = base64::engine::general_purpose::STANDARD.encode(encoder.finish().expect("gzip"));

    let batch = rpc(
        &base,
        "log.writeBatch",
        json!({"compress": true, "records": blob}),
    )
    .await;
    assert_eq!(result(&batch)["written"], 2);

    let queried = rpc(&base, "log.query", json!({"sources": ["bulk"]})).await;
    assert_eq!(result(&queried)["total_matches"], 2);
}

#[tokio::test]
async fn config_reload_applies_to_subsequent_writes() {
    let (base, service, _dir) = start_server(|_| {}).await;

    let before = rpc(
        &base,
        "log.write",
        json!({"level": "INFO", "source": "reload", "message": "chatty probe"}),
    )
    .await;
    assert!(result(&before)["id"].as_u64().expect("id") > 0);

    let mut next = Config::default();
    next.filter.drop_patterns = vec!["chatty".to_owned()];
    service.state.reload_config(next);

    // The same message is now dropped by the filter chain (id 0 signals
    // "accepted but filtered").
    let after = rpc(
        &base,
        "log.write",
        json!({"level": "INFO", "source": "reload", "message": "chatty probe"}),
    )
    .await;
    assert_eq!(result(&after)["id"], 0);
}

#[tokio::test]
async fn error_codes_follow_the_frozen_table() {
    let (base, _service, _dir) = start_server(|_| {}).await;
    let client = reqwest::Client::new();

    // Parse error.
    let parse: Value = client
        .post(format!("{base}/rpc"))
        .body("{not json")
        .send()
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    assert_eq!(parse["error"]["code"], -32700);

    // Invalid request (wrong version).
    let invalid = client
        .post(format!("{base}/rpc"))
        .json(&json!({"jsonrpc": "1.0", "method": "log.query", "id": 1}))
        .send()
        .await
        .expect("send")
        .json::<Value>()
        .await
        .expect("json");
    assert_eq!(invalid["error"]["code"], -32600);

    // Unknown method.
    let unknown = rpc(&base, "log.explode", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    // Invalid params.
    let bad_limit = rpc(&base, "log.query", json!({"limit": 999999})).await;
    assert_eq!(bad_limit["error"]["code"], -32602);

    // Analysis with a bad group_by.
    let bad_group = rpc(
        &base,
        "log.analysis",
        json!({"kind": "performance", "group_by": "$.oops"}),
    )
    .await;
    assert_eq!(bad_group["error"]["code"], -32602);
}

#[tokio::test]
async fn analysis_endpoints_return_kind_specific_reports() {
    let (base, _service, _dir) = start_server(|_| {}).await;

    for i in 0..4 {
        rpc(
            &base,
            "log.write",
            json!({
                "level": "ERROR",
                "source": "mcp_calls",
                "message": format!("tool call {i} failed"),
                "metadata": {"method": "tools/call", "duration_ms": 100 + i}
            }),
        )
        .await;
    }

    let perf = rpc(
        &base,
        "log.analysis",
        json!({"kind": "performance", "timerange": "1h"}),
    )
    .await;
    // The RPC collector's own response records also carry duration_ms, so
    // look the written group up by key instead of expecting it alone.
    let groups = result(&perf)["groups"].as_array().expect("groups");
    let tools = groups
        .iter()
        .find(|g| g["key"] == "tools/call")
        .expect("tools/call group");
    assert_eq!(tools["count"], 4);

    let errors = rpc(
        &base,
        "log.analysis",
        json!({"kind": "errors", "timerange": "1h"}),
    )
    .await;
    let clusters = result(&errors)["clusters"].as_array().expect("clusters");
    assert_eq!(clusters.len(), 1, "messages differing only by number cluster");
    assert_eq!(clusters[0]["count"], 4);

    let trends = rpc(
        &base,
        "log.analysis",
        json!({"kind": "trends", "timerange": "1h"}),
    )
    .await;
    assert!(result(&trends)["buckets"].as_array().expect("buckets").len() > 1);

    let anomalies = rpc(
        &base,
        "log.analysis",
        json!({"kind": "anomalies", "timerange": "1h"}),
    )
    .await;
    assert!(result(&anomalies).get("mean_error_rate").is_some());
}
