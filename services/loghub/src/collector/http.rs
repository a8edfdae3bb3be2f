//! HTTP collector (`http_requests`): a middleware-shaped hook.
//!
//! Wraps the boundary router: assigns a request id, stamps `X-Request-ID`
//! on the response, observes status and duration, flags slow/error
//! requests, and keeps a per-path rolling mean and error count. Configured
//! path prefixes are ignored entirely.

use super::runtime::{
    spawn_runtime, Collector, CollectorError, CollectorHandle, ExtraCounters, RuntimeConfig,
};
use super::CollectorSet;
use crate::pipeline::Ingest;
use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use loghub_protocol::{Level, MetaValue, RecordDraft};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

pub const SOURCE: &str = "http_requests";

/// Per-path rollups beyond this many paths are not tracked individually.
const PATH_ROLLUP_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    /// Requests whose path starts with any of these are not observed.
    pub ignore_prefixes: Vec<String>,
    /// Requests slower than this many milliseconds are flagged.
    pub slow_ms: u64,
}

impl Default for HttpCollectorConfig {
    fn default() -> Self {
        HttpCollectorConfig {
            ignore_prefixes: default_ignore_prefixes(),
            slow_ms: 1_000,
        }
    }
}

pub fn default_ignore_prefixes() -> Vec<String> {
    ["/health", "/favicon.ico", "/static"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[derive(Default)]
struct PathStats {
    count: u64,
    mean_ms: f64,
    errors: u64,
}

#[derive(Default)]
struct HttpInner {
    per_path: StdMutex<HashMap<String, PathStats>>,
    ignore_prefixes: StdMutex<Vec<String>>,
    slow_ms: AtomicU64,
    requests: AtomicU64,
    error_responses: AtomicU64,
    slow_requests: AtomicU64,
}

struct HttpCollector {
    inner: Arc<HttpInner>,
}

#[derive(Clone)]
pub struct HttpObserver {
    inner: Arc<HttpInner>,
    handle: CollectorHandle,
}

/// Register the HTTP collector and return its observer handle.
pub fn register(
    set: &mut CollectorSet,
    collector_cfg: HttpCollectorConfig,
    cfg: RuntimeConfig,
    ingest: Ingest,
    shutdown: watch::Receiver<bool>,
) -> HttpObserver {
    let inner = Arc::new(HttpInner::default());
    *inner
        .ignore_prefixes
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = collector_cfg.ignore_prefixes;
    inner.slow_ms.store(collector_cfg.slow_ms, Ordering::Relaxed);
    let adapter = HttpCollector {
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
    HttpObserver { inner, handle }
}

impl Collector for HttpCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn on_start(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn apply_config(&mut self, patch: &serde_json::Value) -> Result<(), CollectorError> {
        let mut applied = false;
        if let Some(prefixes) = patch.get("ignore_prefixes").and_then(|v| v.as_array()) {
            let parsed: Vec<String> = prefixes
                .iter()
                .filter_map(|p| p.as_str().map(str::to_owned))
                .collect();
            *self
                .inner
                .ignore_prefixes
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = parsed;
            applied = true;
        }
        if let Some(ms) = patch.get("slow_ms").and_then(serde_json::Value::as_u64) {
            self.inner.slow_ms.store(ms, Ordering::Relaxed);
            applied = true;
        }
        if applied {
            Ok(())
        } else {
            Err(CollectorError::Config(
                "supported patch keys: ignore_prefixes, slow_ms".to_owned(),
            ))
        }
    }
}

impl HttpObserver {
    /// The middleware entry point; wire with `axum::middleware::from_fn`.
    pub async fn observe(&self, req: Request<Body>, next: Next) -> Response {
        let path = req.uri().path().to_owned();
        let ignored = {
            let prefixes = self
                .inner
                .ignore_prefixes
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            prefixes.iter().any(|p| path.starts_with(p.as_str()))
        };
        if ignored {
            return next.run(req).await;
        }

        let method = req.method().to_string();
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut response = next.run(req).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = response.status().as_u16();

        if let Ok(header) = request_id.parse() {
            response.headers_mut().insert("x-request-id", header);
        }

        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        let error = status >= 500;
        if error {
            self.inner.error_responses.fetch_add(1, Ordering::Relaxed);
            self.handle.note_error();
        }
        let slow = duration_ms as u64 >= self.inner.slow_ms.load(Ordering::Relaxed);
        if slow {
            self.inner.slow_requests.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut per_path = self
                .inner
                .per_path
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if per_path.len() < PATH_ROLLUP_CAP || per_path.contains_key(&path) {
                let stats = per_path.entry(path.clone()).or_default();
                stats.count += 1;
                stats.mean_ms += (duration_ms - stats.mean_ms) / stats.count as f64;
                if error {
                    stats.errors += 1;
                }
            }
        }

        let level = if status >= 500 {
            Level::Error
        } else if status >= 400 {
            Level::Warn
        } else {
            Level::Info
        };
        let mut draft = RecordDraft::new(
            level,
            SOURCE,
            format!("{method} {path} {status} ({duration_ms:.1}ms)"),
        )
        .with_meta("method", method)
        .with_meta("path", path)
        .with_meta("status", MetaValue::Int(i64::from(status)))
        .with_meta("duration_ms", MetaValue::Float(duration_ms))
        .with_meta("request_id", request_id.as_str())
        .with_trace(request_id);
        if slow {
            draft = draft.with_meta("slow", MetaValue::Bool(true)).with_tag("slow");
        }
        self.handle.collect(draft).await;

        response
    }
}

impl ExtraCounters for HttpInner {
    fn extras(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        out.insert(
            "requests".to_owned(),
            serde_json::json!(self.requests.load(Ordering::Relaxed)),
        );
        out.insert(
            "error_responses".to_owned(),
            serde_json::json!(self.error_responses.load(Ordering::Relaxed)),
        );
        out.insert(
            "slow_requests".to_owned(),
            serde_json::json!(self.slow_requests.load(Ordering::Relaxed)),
        );
        let per_path = self.per_path.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<(&String, &PathStats)> = per_path.iter().collect();
        paths.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(b.0)));
        let rollup: serde_json::Map<String, serde_json::Value> = paths
            .into_iter()
            .take(20)
            .map(|(path, stats)| {
                (
                    path.clone(),
                    serde_json::json!({
                        "count": stats.count,
                        "mean_ms": (stats.mean_ms * 10.0).round() / 10.0,
                        "errors": stats.errors,
                    }),
                )
            })
            .collect();
        out.insert("paths".to_owned(), serde_json::Value::Object(rollup));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::running_set;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn test_router(observer: HttpObserver) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/health", get(|| async { "ok" }))
            .route(
                "/boom",
                get(|| async {
                    (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        "boom",
                    )
                }),
            )
            .layer(axum::middleware::from_fn(
                move |req: axum::extract::Request, next: Next| {
                    let observer = observer.clone();
                    async move { observer.observe(req, next).await }
                },
            ))
    }

    #[tokio::test]
    async fn requests_are_recorded_with_status_and_request_id() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            HttpCollectorConfig::default(),
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;
        let router = test_router(observer);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/ok")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(response.headers().contains_key("x-request-id"));

        let records = harness.collect_records(1).await;
        assert!(records[0].message.starts_with("GET /ok 200"));
        assert_eq!(
            records[0].metadata.get("status"),
            Some(&MetaValue::Int(200))
        );
        assert!(records[0].trace_id.is_some());
    }

    #[tokio::test]
    async fn ignored_prefixes_are_not_observed_and_errors_are_flagged() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            HttpCollectorConfig::default(),
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;
        let router = test_router(observer);

        // Ignored path: no record, no counter.
        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        let records = harness.collect_records(1).await;
        assert!(records[0].message.starts_with("GET /boom 500"));
        assert_eq!(records[0].level, Level::Error);

        let extras = harness.set.status()[SOURCE].counters.extras.clone();
        assert_eq!(extras["requests"], 1);
        assert_eq!(extras["error_responses"], 1);
        assert_eq!(extras["paths"]["/boom"]["errors"], 1);
        assert!(extras["paths"].get("/health").is_none());
    }
}
