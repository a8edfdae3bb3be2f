//! AI bridge collector (`ai_analysis`): observes analysis jobs and their
//! underlying native bridge invocations.
//!
//! Emits start/complete/error records per analysis and one record per
//! bridge call; analyses and calls past their slow thresholds are flagged.

use super::runtime::{
    spawn_runtime, Collector, CollectorError, CollectorHandle, ExtraCounters, RuntimeConfig,
};
use super::CollectorSet;
use crate::pipeline::Ingest;
use loghub_protocol::{Level, MetaValue, RecordDraft};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const SOURCE: &str = "ai_analysis";

#[derive(Debug, Clone)]
pub struct BridgeCollectorConfig {
    /// Analyses running longer than this are flagged slow.
    pub slow_analysis: Duration,
    /// Individual bridge calls longer than this are flagged slow.
    pub slow_call: Duration,
}

impl Default for BridgeCollectorConfig {
    fn default() -> Self {
        BridgeCollectorConfig {
            slow_analysis: Duration::from_secs(30),
            slow_call: Duration::from_secs(5),
        }
    }
}

struct Analysis {
    kind: String,
    started_at: Instant,
    bridge_calls: u64,
}

#[derive(Default)]
struct BridgeInner {
    active: StdMutex<HashMap<String, Analysis>>,
    analyses_started: AtomicU64,
    analyses_completed: AtomicU64,
    analyses_failed: AtomicU64,
    bridge_calls: AtomicU64,
    slow_calls: AtomicU64,
    slow_analyses: AtomicU64,
    slow_analysis_ms: AtomicU64,
    slow_call_ms: AtomicU64,
}

struct BridgeCollector {
    inner: Arc<BridgeInner>,
}

#[derive(Clone)]
pub struct BridgeObserver {
    inner: Arc<BridgeInner>,
    handle: CollectorHandle,
}

/// Register the AI bridge collector and return its observer handle.
pub fn register(
    set: &mut CollectorSet,
    collector_cfg: BridgeCollectorConfig,
    cfg: RuntimeConfig,
    ingest: Ingest,
    shutdown: watch::Receiver<bool>,
) -> BridgeObserver {
    let inner = Arc::new(BridgeInner::default());
    inner.slow_analysis_ms.store(
        collector_cfg.slow_analysis.as_millis() as u64,
        Ordering::Relaxed,
    );
    inner
        .slow_call_ms
        .store(collector_cfg.slow_call.as_millis() as u64, Ordering::Relaxed);
    let adapter = BridgeCollector {
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
    BridgeObserver { inner, handle }
}

impl Collector for BridgeCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn on_start(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), CollectorError> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn apply_config(&mut self, patch: &serde_json::Value) -> Result<(), CollectorError> {
        let mut applied = false;
        if let Some(ms) = patch
            .get("slow_analysis_ms")
            .and_then(serde_json::Value::as_u64)
        {
            self.inner.slow_analysis_ms.store(ms, Ordering::Relaxed);
            applied = true;
        }
        if let Some(ms) = patch.get("slow_call_ms").and_then(serde_json::Value::as_u64) {
            self.inner.slow_call_ms.store(ms, Ordering::Relaxed);
            applied = true;
        }
        if applied {
            Ok(())
        } else {
            Err(CollectorError::Config(
                "supported patch keys: slow_analysis_ms, slow_call_ms".to_owned(),
            ))
        }
    }
}

impl BridgeObserver {
    pub async fn analysis_started(&self, analysis_id: &str, kind: &str) {
        self.inner.analyses_started.fetch_add(1, Ordering::Relaxed);
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                analysis_id.to_owned(),
                Analysis {
                    kind: kind.to_owned(),
                    started_at: Instant::now(),
                    bridge_calls: 0,
                },
            );
        let draft = RecordDraft::new(
            Level::Info,
            SOURCE,
            format!("analysis {kind} started"),
        )
        .with_meta("analysis_id", analysis_id)
        .with_meta("type", kind)
        .with_trace(format!("analysis-{analysis_id}"));
        self.handle.collect(draft).await;
    }

    /// One underlying bridge invocation inside an analysis.
    pub async fn bridge_call(
        &self,
        analysis_id: &str,
        function: &str,
        duration: Duration,
        ok: bool,
    ) {
        self.inner.bridge_calls.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(analysis) = active.get_mut(analysis_id) {
                analysis.bridge_calls += 1;
            }
        }
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let slow = duration.as_millis() as u64 >= self.inner.slow_call_ms.load(Ordering::Relaxed);
        if slow {
            self.inner.slow_calls.fetch_add(1, Ordering::Relaxed);
        }
        let level = if !ok {
            Level::Error
        } else if slow {
            Level::Warn
        } else {
            Level::Debug
        };
        if !ok {
            self.handle.note_error();
        }
        let mut draft = RecordDraft::new(
            level,
            SOURCE,
            format!("bridge call {function} ({duration_ms:.1}ms)"),
        )
        .with_meta("analysis_id", analysis_id)
        .with_meta("function", function)
        .with_meta("duration_ms", MetaValue::Float(duration_ms))
        .with_trace(format!("analysis-{analysis_id}"));
        if slow {
            draft = draft.with_meta("slow", MetaValue::Bool(true)).with_tag("slow");
        }
        self.handle.collect(draft).await;
    }

    pub async fn analysis_completed(&self, analysis_id: &str, ok: bool, error: Option<&str>) {
        let entry = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(analysis_id);
        let (kind, duration_ms, calls) = match entry {
            Some(analysis) => (
                analysis.kind,
                analysis.started_at.elapsed().as_secs_f64() * 1000.0,
                analysis.bridge_calls,
            ),
            None => ("unknown".to_owned(), 0.0, 0),
        };

        let slow =
            duration_ms as u64 >= self.inner.slow_analysis_ms.load(Ordering::Relaxed);
        if slow {
            self.inner.slow_analyses.fetch_add(1, Ordering::Relaxed);
        }
        let level = if !ok {
            self.inner.analyses_failed.fetch_add(1, Ordering::Relaxed);
            self.handle.note_error();
            Level::Error
        } else {
            self.inner
                .analyses_completed
                .fetch_add(1, Ordering::Relaxed);
            if slow {
                Level::Warn
            } else {
                Level::Info
            }
        };

        let verb = if ok { "completed" } else { "failed" };
        let mut draft = RecordDraft::new(
            level,
            SOURCE,
            format!("analysis {kind} {verb} ({duration_ms:.1}ms)"),
        )
        .with_meta("analysis_id", analysis_id)
        .with_meta("type", kind)
        .with_meta("duration_ms", MetaValue::Float(duration_ms))
        .with_meta("python_calls", MetaValue::Int(calls as i64))
        .with_trace(format!("analysis-{analysis_id}"));
        if slow {
            draft = draft.with_meta("slow", MetaValue::Bool(true)).with_tag("slow");
        }
        if let Some(error) = error {
            draft = draft.with_meta("error", error);
        }
        self.handle.collect(draft).await;
    }
}

impl ExtraCounters for BridgeInner {
    fn extras(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        out.insert(
            "analyses_started".to_owned(),
            serde_json::json!(self.analyses_started.load(Ordering::Relaxed)),
        );
        out.insert(
            "analyses_completed".to_owned(),
            serde_json::json!(self.analyses_completed.load(Ordering::Relaxed)),
        );
        out.insert(
            "analyses_failed".to_owned(),
            serde_json::json!(self.analyses_failed.load(Ordering::Relaxed)),
        );
        out.insert(
            "active_analyses".to_owned(),
            serde_json::json!(self.active.lock().unwrap_or_else(|e| e.into_inner()).len()),
        );
        out.insert(
            "bridge_calls".to_owned(),
            serde_json::json!(self.bridge_calls.load(Ordering::Relaxed)),
        );
        out.insert(
            "slow_calls".to_owned(),
            serde_json::json!(self.slow_calls.load(Ordering::Relaxed)),
        );
        out.insert(
            "slow_analyses".to_owned(),
            serde_json::json!(self.slow_analyses.load(Ordering::Relaxed)),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::running_set;

    #[tokio::test]
    async fn analysis_lifecycle_emits_paired_records_with_call_count() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            BridgeCollectorConfig::default(),
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;

        observer.analysis_started("a1", "pattern_detection").await;
        observer
            .bridge_call("a1", "numpy.fft", Duration::from_millis(12), true)
            .await;
        observer.analysis_completed("a1", true, None).await;

        let records = harness.collect_records(3).await;
        assert!(records[0].message.contains("pattern_detection started"));
        assert!(records[1].message.starts_with("bridge call numpy.fft"));
        assert!(records[2].message.contains("completed"));
        assert_eq!(
            records[2].metadata.get("python_calls"),
            Some(&MetaValue::Int(1))
        );
        assert!(records
            .iter()
            .all(|r| r.trace_id.as_deref() == Some("analysis-a1")));
    }

    #[tokio::test]
    async fn slow_calls_are_flagged_and_failures_counted() {
        let mut harness = running_set().await;
        let observer = register(
            &mut harness.set,
            BridgeCollectorConfig {
                slow_call: Duration::from_millis(1),
                ..BridgeCollectorConfig::default()
            },
            RuntimeConfig::default(),
            harness.ingest.clone(),
            harness.shutdown.clone(),
        );
        harness.start_and_wait(SOURCE).await;

        observer.analysis_started("a2", "summarize").await;
        observer
            .bridge_call("a2", "model.generate", Duration::from_millis(50), true)
            .await;
        observer
            .analysis_completed("a2", false, Some("bridge crashed"))
            .await;

        let records = harness.collect_records(3).await;
        assert_eq!(records[1].level, Level::Warn);
        assert!(records[1].tags.iter().any(|t| t == "slow"));
        assert_eq!(records[2].level, Level::Error);

        let extras = harness.set.status()[SOURCE].counters.extras.clone();
        assert_eq!(extras["slow_calls"], 1);
        assert_eq!(extras["analyses_failed"], 1);
    }
}
