//! Service wiring: build every subsystem in dependency order and expose the
//! shared application state to the boundary server.
//!
//! Lifecycle: storage → pipeline → broker → retention → collectors →
//! HTTP/WS server. Shutdown reverses it: the server stops accepting,
//! collectors stop, the pipeline drains its queue and flushes a final
//! batch, the broker closes subscriptions, retention exits.

use crate::api::QueryApi;
use crate::broker::{Broker, BrokerConfig};
use crate::collector::{bridge, http, rpc, websocket, CollectorSet, RuntimeConfig};
use crate::config::{Config, SharedConfig};
use crate::deadletter::DeadLetter;
use crate::filter::Sanitizer;
use crate::pipeline::{spawn_pipeline, Ingest, IngestCounters, PipelineConfig};
use crate::storage::retention::{run_retention_task, RetentionConfig};
use crate::storage::{LogStore, StorageError};
use chrono::{DateTime, SecondsFormat, Utc};
use loghub_protocol::{HealthCheck, HealthResult, StatusResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state handed to every HTTP/WS handler.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub db_path: PathBuf,
    pub ingest: Ingest,
    pub ingest_counters: Arc<IngestCounters>,
    pub sanitizer: Arc<Sanitizer>,
    pub api: Arc<QueryApi>,
    pub broker: Broker,
    pub collectors: Arc<CollectorSet>,
    pub rpc_observer: rpc::RpcObserver,
    pub ws_observer: websocket::WsObserver,
    pub bridge_observer: bridge::BridgeObserver,
    pub http_observer: http::HttpObserver,
    pub started_at: DateTime<Utc>,
    pub start_instant: Instant,
    pub shutdown: watch::Receiver<bool>,
}

/// The built service: state plus the handles needed for orderly shutdown.
pub struct Service {
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    pipeline_task: tokio::task::JoinHandle<()>,
}

/// Build all subsystems from a loaded config.
pub async fn build_service(config: Config) -> Result<Service, BuildError> {
    let shared_config = SharedConfig::new(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Storage (single write handle, shared with retention).
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Mutex::new(LogStore::open(&config.storage.db_path)?));
    info!(path = %config.storage.db_path.display(), "storage open");

    // Filter chain + ingest pipeline.
    let sanitizer = Arc::new(Sanitizer::new(&config.filter_config()));
    let (batch_tx, batch_rx) = mpsc::channel(64);
    let (ingest, ingest_counters, pipeline_task) = spawn_pipeline(
        PipelineConfig {
            buffer: config.ingest.buffer,
            enqueue_deadline: Duration::from_millis(config.ingest.enqueue_deadline_ms),
            max_batch: config.ingest.batch_size,
            max_batch_latency: Duration::from_millis(config.ingest.flush_interval_ms),
            ..PipelineConfig::default()
        },
        sanitizer.clone(),
        store.clone(),
        batch_tx,
        DeadLetter::new(config.storage.dead_letter_path.clone()),
        shutdown_rx.clone(),
    );

    // Stream broker over committed batches.
    let broker = Broker::spawn(
        BrokerConfig {
            default_buffer: config.stream.subscriber_buffer,
            grace: Duration::from_millis(config.stream.reconnect_grace_ms),
            auto_reconnect: config.stream.auto_reconnect,
            max_subscribers: config.stream.ws_max_subscribers,
        },
        batch_rx,
        shutdown_rx.clone(),
    );

    // Retention task (shares the write handle).
    tokio::spawn(run_retention_task(
        store.clone(),
        RetentionConfig {
            max_age_days: config.storage.retention_days,
            max_size_mb: config.storage.max_size_mb,
            check_interval: Duration::from_secs(config.storage.retention_check_secs),
            delete_batch: 1_000,
        },
        shutdown_rx.clone(),
    ));

    // Collectors.
    let runtime_cfg = RuntimeConfig {
        auto_restart: config.collectors.auto_restart,
        retry_delay: Duration::from_millis(config.collectors.retry_delay_ms),
        max_retries: config.collectors.max_retries,
        health_check_interval: Duration::from_millis(config.collectors.health_check_interval_ms),
    };
    let mut set = CollectorSet::new();
    let rpc_observer = rpc::register(
        &mut set,
        runtime_cfg.clone(),
        ingest.clone(),
        shutdown_rx.clone(),
    );
    let ws_observer = websocket::register(
        &mut set,
        websocket::WsCollectorConfig {
            log_messages: config.collectors.websocket_log_messages,
        },
        runtime_cfg.clone(),
        ingest.clone(),
        shutdown_rx.clone(),
    );
    let bridge_observer = bridge::register(
        &mut set,
        bridge::BridgeCollectorConfig {
            slow_analysis: Duration::from_millis(config.collectors.ai_slow_analysis_ms),
            slow_call: Duration::from_millis(config.collectors.ai_slow_call_ms),
        },
        runtime_cfg.clone(),
        ingest.clone(),
        shutdown_rx.clone(),
    );
    let http_observer = http::register(
        &mut set,
        http::HttpCollectorConfig {
            ignore_prefixes: config.collectors.http_ignore_prefixes.clone(),
            slow_ms: config.collectors.http_slow_ms,
        },
        runtime_cfg,
        ingest.clone(),
        shutdown_rx.clone(),
    );
    let collectors = Arc::new(set);
    for name in &config.collectors.enabled {
        if let Err(e) = collectors.toggle(name, true).await {
            warn!(collector = %name, error = %e, "enabled collector could not start");
        }
    }

    let api = Arc::new(QueryApi::new(
        config.storage.db_path.clone(),
        config.query.max_concurrent,
        Duration::from_millis(config.query.queue_wait_ms),
        Duration::from_millis(config.query.default_timeout_ms),
    ));

    let state = AppState {
        config: shared_config,
        db_path: config.storage.db_path.clone(),
        ingest,
        ingest_counters,
        sanitizer,
        api,
        broker,
        collectors,
        rpc_observer,
        ws_observer,
        bridge_observer,
        http_observer,
        started_at: Utc::now(),
        start_instant: Instant::now(),
        shutdown: shutdown_rx,
    };

    Ok(Service {
        state,
        shutdown_tx,
        pipeline_task,
    })
}

impl Service {
    /// Orderly shutdown: collectors first, then the shutdown signal fans
    /// out to pipeline/broker/retention; the pipeline gets until the
    /// graceful deadline to drain.
    pub async fn shutdown(self) {
        let timeout = Duration::from_millis(
            self.state.config.load().graceful_shutdown_timeout_ms,
        );
        self.state.collectors.stop_all().await;
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(timeout, self.pipeline_task).await {
            Ok(_) => info!("pipeline drained"),
            Err(_) => warn!("pipeline did not drain before the graceful deadline"),
        }
    }
}

impl AppState {
    /// Swap in a reloaded config; filter parameters and query limits apply
    /// to subsequent operations.
    pub fn reload_config(&self, config: Config) {
        self.sanitizer.reconfigure(&config.filter_config());
        self.config.store(config);
        info!("config reloaded");
    }

    /// Assemble `system.status`.
    pub async fn status(&self) -> StatusResult {
        let (total_logs, disk_bytes) = self.api.totals().await.unwrap_or((0, 0));
        let mut ingest: BTreeMap<String, u64> = self.ingest_counters.snapshot();
        ingest.extend(self.sanitizer.counters.snapshot());
        ingest.insert("queue_depth".to_owned(), self.ingest.depth() as u64);
        ingest.insert(
            "stream_subscribers".to_owned(),
            self.broker.subscriber_count().await as u64,
        );
        ingest.insert(
            "stream_dropped".to_owned(),
            self.broker.total_dropped().await,
        );
        ingest.extend(
            self.collectors
                .global_counters()
                .into_iter()
                .map(|(k, v)| (format!("collectors_{k}"), v)),
        );

        StatusResult {
            server_status: "running".to_owned(),
            total_logs,
            disk_usage_mb: disk_bytes as f64 / (1024.0 * 1024.0),
            memory_usage_mb: resident_memory_mb(),
            uptime_seconds: self.start_instant.elapsed().as_secs(),
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            collectors: self.collectors.status(),
            ingest,
        }
    }

    /// Assemble `system.health`.
    pub async fn health(&self) -> HealthResult {
        let mut checks = Vec::new();
        checks.push(match self.api.totals().await {
            Ok(_) => HealthCheck {
                name: "storage".to_owned(),
                ok: true,
                detail: None,
            },
            Err(e) => HealthCheck {
                name: "storage".to_owned(),
                ok: false,
                detail: Some(e.to_string()),
            },
        });
        let depth = self.ingest.depth();
        let buffer = self.config.load().ingest.buffer;
        checks.push(HealthCheck {
            name: "ingest".to_owned(),
            ok: depth < buffer,
            detail: (depth > 0).then(|| format!("{depth} queued")),
        });
        checks.push(HealthCheck {
            name: "broker".to_owned(),
            ok: true,
            detail: Some(format!(
                "{} subscribers",
                self.broker.subscriber_count().await
            )),
        });
        checks.extend(self.collectors.health_checks());

        HealthResult {
            ok: checks.iter().all(|c| c.ok),
            checks,
        }
    }
}

/// Resident set size in MiB, best effort.
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> f64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map_or(0.0, |pages| (pages * 4096) as f64 / (1024.0 * 1024.0))
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> f64 {
    0.0
}
