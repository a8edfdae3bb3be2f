//! WebSocket collector (`websocket`): observes stream sessions.
//!
//! Per-connection byte/message counters and a message-type histogram.
//! Connect/disconnect/error records are always emitted; per-message records
//! are opt-in (`log_messages`) to avoid floods.

use super::runtime::{
    spawn_runtime, Collector, CollectorError, CollectorHandle, ExtraCounters, RuntimeConfig,
};
use super::CollectorSet;
use crate::pipeline::Ingest;
use loghub_protocol::{Level, MetaValue, RecordDraft};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::watch;

pub const SOURCE: &str = "websocket";

#[derive(Debug, Clone, Default)]
pub struct WsCollectorConfig {
    /// Emit a record per message (off by default; floods otherwise).
    pub log_messages: bool,
}

struct ConnStats {
    bytes_in: u64,
    bytes_out: u64,
    messages: u64,
    opened_at: Instant,
}

#[derive(Default)]
struct WsInner {
    connections: StdMutex<HashMap<String, ConnStats>>,
    msg_types: StdMutex<HashMap<String, u64>>,
    log_messages: AtomicBool,
    total_connects: AtomicU64,
    total_messages: AtomicU64,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
    ws_errors: AtomicU64,
}

struct WsCollector {
    inner: Arc<WsInner>,
}

#[derive(Clone)]
pub struct WsObserver {
    inner: Arc<WsInner>,
    handle: CollectorHandle,
}

/// Register the WebSocket collector and return its observer handle.
pub fn register(
    set: &mut CollectorSet,
    collector_cfg: WsCollectorConfig,
    cfg: RuntimeConfig,
    ingest: Ingest,
    shutdown: watch::Receiver<bool>,
) -> WsObserver {
    let inner = Arc::new(WsInner::default());
    inner
        .log_messages
        .store(collector_cfg.log_messages, Ordering::Relaxed);
    let adapter = WsCollector {
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
    WsObserver { inner, handle }
}

impl Collector for WsCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn on_start(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), CollectorError> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn apply_config(&mut self, patch: &serde_json::Value) -> Result<(), CollectorError> {
        match patch.get("log_messages").and_then(serde_json::Value::as_bool) {
            Some(enabled) => {
                self.inner.log_messages.store(enabled, Ordering::Relaxed);
                Ok(())
            }
            None => Err(CollectorError::Config(
                "supported patch keys: log_messages".to_owned(),
            )),
        }
    }
}

impl WsObserver {
    pub async fn connection_opened(&self, conn_id: &str) {
        self.inner.total_connects.fetch_add(1, Ordering::Relaxed);
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                conn_id.to_owned(),
                ConnStats {
                    bytes_in: 0,
                    bytes_out: 0,
                    messages: 0,
                    opened_at: Instant::now(),
                },
            );
        let draft = RecordDraft::new(Level::Info, SOURCE, "websocket connected")
            .with_meta("connection_id", conn_id)
            .with_trace(format!("ws-{conn_id}"));
        self.handle.collect(draft).await;
    }

    /// Count one message; emits a record only when `log_messages` is on.
    pub async fn message(&self, conn_id: &str, msg_type: &str, inbound: bool, bytes: usize) {
        self.inner.total_messages.fetch_add(1, Ordering::Relaxed);
        if inbound {
            self.inner
                .total_bytes_in
                .fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.inner
                .total_bytes_out
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
        {
            let mut connections = self
                .inner
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(conn) = connections.get_mut(conn_id) {
                conn.messages += 1;
                if inbound {
                    conn.bytes_in += bytes as u64;
                } else {
                    conn.bytes_out += bytes as u64;
                }
            }
        }
        *self
            .inner
            .msg_types
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(msg_type.to_owned())
            .or_insert(0) += 1;

        if self.inner.log_messages.load(Ordering::Relaxed) {
            let direction = if inbound { "in" } else { "out" };
            let draft = RecordDraft::new(
                Level::Debug,
                SOURCE,
                format!("websocket message {msg_type} ({direction}, {bytes}B)"),
            )
            .with_meta("connection_id", conn_id)
            .with_meta("message_type", msg_type)
            .with_meta("direction", direction)
            .with_meta("bytes", MetaValue::Int(bytes as i64))
            .with_trace(format!("ws-{conn_id}"));
            self.handle.collect(draft).await;
        }
    }

    pub async fn connection_closed(&self, conn_id: &str, reason: &str) {
        let stats = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id);
        let mut draft = RecordDraft::new(Level::Info, SOURCE, "websocket disconnected")
            .with_meta("connection_id", conn_id)
            .with_meta("reason", reason)
            .with_trace(format!("ws-{conn_id}"));
        if let Some(stats) = stats {
            draft = draft
                .with_meta("messages", MetaValue::Int(stats.messages as i64))
                .with_meta("bytes_in", MetaValue::Int(stats.bytes_in as i64))
                .with_meta("bytes_out", MetaValue::Int(stats.bytes_out as i64))
                .with_meta(
                    "duration_ms",
                    MetaValue::Float(stats.opened_at.elapsed().as_secs_f64() * 1000.0),
                );
        }
        self.handle.collect(draft).await;
    }

    pub async fn connection_error(&self, conn_id: &str, error: &str) {
        self.inner.ws_errors.fetch_add(1, Ordering::Relaxed);
        self.handle.note_error();
        let draft = RecordDraft::new(Level::Error, SOURCE, format!("websocket error: {error}"))
            .with_meta("connection_id", conn_id)
            .with_trace(format!("ws-{conn_id}"));
        self.handle.collect(draft).await;
    }
}

impl ExtraCounters for WsInner {
    fn extras(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        out.insert(
            "connects".to_owned(),
            serde_json::json!(self.total_connects.load(Ordering::Relaxed)),
        );
        out.insert(
            "active_connections".to_owned(),
            serde_json::json!(
                self.connections
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .len()
            ),
        );
        out.insert(
            "messages".to_owned(),
            serde_json::json!(self.total_messages.load(Ordering::Relaxed)),
        );
        out.insert(
            "bytes_in".to_owned(),
            serde_json::json!(self.total_bytes_in.load(Ordering::Relaxed)),
        );
        out.insert(
            "bytes_out".to_owned(),
            serde_json::json!(self.total_bytes_out.load(Ordering::Relaxed)),
        );
        out.insert(
            "ws_errors".to_owned(),
            serde_json::json!(self.ws_errors.load(Ordering::Relaxed)),
        );
        let msg_types = self.msg_types.lock().unwrap_or_else(|e| e.into_inner());
        let histogram: serde_json::Map<String, serde_json::Value> = msg_types
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        out.insert(
            "message_types".to_owned(),
            serde_json::Value::Object(histogram),
        );
        out
    }
}
