//! RPC collector (`mcp_calls`): observes inbound JSON-RPC calls.
//!
//! Tracks in-flight requests by request id, computes per-method running
//! means on response, and emits paired request/response records sharing a
//! `trace_id` derived from the request id.

use super::runtime::{
    spawn_runtime, Collector, CollectorError, CollectorHandle, ExtraCounters, RuntimeConfig,
};
use super::CollectorSet;
use crate::pipeline::Ingest;
use loghub_protocol::{Level, MetaValue, RecordDraft};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::watch;

/// Per-method rollups beyond this many methods are elided from status.
const METHOD_ROLLUP_CAP: usize = 20;

pub const SOURCE: &str = "mcp_calls";

struct InFlight {
    method: String,
    started_at: Instant,
    trace_id: String,
}

#[derive(Default)]
struct MethodStats {
    count: u64,
    mean_ms: f64,
    errors: u64,
}

#[derive(Default)]
struct RpcInner {
    in_flight: StdMutex<HashMap<String, InFlight>>,
    per_method: StdMutex<HashMap<String, MethodStats>>,
    requests: AtomicU64,
    responses: AtomicU64,
    errors: AtomicU64,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct RpcCollector {
    inner: Arc<RpcInner>,
}

/// Source-side handle the RPC dispatcher calls.
#[derive(Clone)]
pub struct RpcObserver {
    inner: Arc<RpcInner>,
    handle: CollectorHandle,
}

/// Register the RPC collector and return its observer handle.
pub fn register(
    set: &mut CollectorSet,
    cfg: RuntimeConfig,
    ingest: Ingest,
    shutdown: watch::Receiver<bool>,
) -> RpcObserver {
    let inner = Arc::new(RpcInner::default());
    let adapter = RpcCollector {
        inner: inner.clone(),
    };
    let (cell, handle) = spawn_runtime(
        Box::new(adapter),
        SOURCE.to_owned(),
        Some(inner.clone() as Arc<dyn ExtraCounters>),
        cfg,
        ingest,
        shutdown,
    );
    set.register(cell);
    RpcObserver { inner, handle }
}

impl Collector for RpcCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn on_start(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), CollectorError> {
        // Abandon any requests still in flight; their responses will be
        // dropped by the running-state gate anyway.
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

impl RpcObserver {
    /// Note an inbound request and emit its request record.
    pub async fn request_started(&self, request_id: &str, method: &str) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("rpc-{request_id}");
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                request_id.to_owned(),
                InFlight {
                    method: method.to_owned(),
                    started_at: Instant::now(),
                    trace_id: trace_id.clone(),
                },
            );

        let draft = RecordDraft::new(Level::Debug, SOURCE, format!("rpc request {method}"))
            .with_meta("method", method)
            .with_meta("request_id", request_id)
            .with_trace(trace_id);
        self.handle.collect(draft).await;
    }

    /// Note the response, update per-method stats, emit the paired record.
    pub async fn request_finished(&self, request_id: &str, ok: bool, error: Option<&str>) {
        let entry = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        let (method, duration_ms, trace_id) = match entry {
            Some(in_flight) => (
                in_flight.method,
                in_flight.started_at.elapsed().as_secs_f64() * 1000.0,
                in_flight.trace_id,
            ),
            None => ("unknown".to_owned(), 0.0, format!("rpc-{request_id}")),
        };

        self.inner.responses.fetch_add(1, Ordering::Relaxed);
        {
            let mut per_method = self
                .inner
                .per_method
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let stats = per_method.entry(method.clone()).or_default();
            stats.count += 1;
            stats.mean_ms += (duration_ms - stats.mean_ms) / stats.count as f64;
            if !ok {
                stats.errors += 1;
            }
        }

        let level = if ok { Level::Info } else { Level::Error };
        if !ok {
            self.inner.errors.fetch_add(1, Ordering::Relaxed);
            self.handle.note_error();
        }
        let mut draft = RecordDraft::new(
            level,
            SOURCE,
            format!("rpc response {method} ({duration_ms:.1}ms)"),
        )
        .with_meta("method", method)
        .with_meta("request_id", request_id)
        .with_meta("duration_ms", MetaValue::Float(duration_ms))
        .with_trace(trace_id);
        if let Some(error) = error {
            draft = draft.with_meta("error", error);
        }
        self.handle.collect(draft).await;
    }
}

impl ExtraCounters for RpcInner {
    fn extras(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        out.insert(
            "requests".to_owned(),
            serde_json::json!(self.requests.load(Ordering::Relaxed)),
        );
        out.insert(
            "responses".to_owned(),
            serde_json::json!(self.responses.load(Ordering::Relaxed)),
        );
        out.insert(
            "rpc_errors".to_owned(),
            serde_json::json!(self.errors.load(Ordering::Relaxed)),
        );
        out.insert(
            "in_flight".to_owned(),
            serde_json::json!(
                self.in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .len()
            ),
        );

        let per_method = self.per_method.lock().unwrap_or_else(|e| e.into_inner());
        let mut methods: Vec<(&String, &MethodStats)> = per_method.iter().collect();
        methods.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(b.0)));
        let rollup: serde_json::Map<String, serde_json::Value> = methods
            .into_iter()
            .take(METHOD_ROLLUP_CAP)
            .map(|(method, stats)| {
                (
                    method.clone(),
                    serde_json::json!({
                        "count": stats.count,
                        "mean_ms": (stats.mean_ms * 10.0).round() / 10.0,
                        "errors": stats.errors,
                    }),
                )
            })
            .collect();
        out.insert("methods".to_owned(), serde_json::Value::Object(rollup));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::running_set;
    use loghub_protocol::LogRecord;

    #[tokio::test]
    async fn paired_records_share_a_trace_and_update_method_means() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;

        observer.request_started("42", "log.query").await;
        observer.request_finished("42", true, None).await;

        let records: Vec<LogRecord> = harness.collect_records(2).await;
        assert_eq!(records[0].trace_id, records[1].trace_id);
        assert_eq!(records[0].trace_id.as_deref(), Some("rpc-42"));
        assert!(records[1].message.starts_with("rpc response log.query"));
        assert_eq!(
            records[1].metadata.get("method").and_then(|m| m.as_str()),
            Some("log.query")
        );
        assert!(records[1].metadata.contains_key("duration_ms"));
        assert!(records[0].tags.contains(&format!("collector:{SOURCE}")));
        assert!(records[0].metadata.contains_key("collected_at"));

        let extras = harness.set.status()[SOURCE].counters.extras.clone();
        assert_eq!(extras["requests"], 1);
        assert_eq!(extras["responses"], 1);
        assert_eq!(extras["methods"]["log.query"]["count"], 1);
    }

    #[tokio::test]
    async fn failed_responses_count_errors() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;

        observer.request_started("7", "log.write").await;
        observer
            .request_finished("7", false, Some("storage_unavailable"))
            .await;

        let records = harness.collect_records(2).await;
        assert_eq!(records[1].level, Level::Error);
        assert_eq!(
            records[1].metadata.get("error").and_then(|m| m.as_str()),
            Some("storage_unavailable")
        );
        let status = &harness.set.status()[SOURCE];
        assert_eq!(status.counters.errors, 1);
    }
}
