//! Collector framework: uniform lifecycle for heterogeneous ingest sources.
//!
//! [`runtime`] owns the shared state machine; the built-in collectors
//! ([`rpc`], [`websocket`], [`bridge`], [`http`]) are thin adapters plus a
//! source-side observer handle that the host wires into its surfaces. The
//! [`CollectorSet`] registry routes control commands and aggregates status.

pub mod bridge;
pub mod http;
pub mod rpc;
pub mod runtime;
pub mod websocket;

pub use runtime::{
    spawn_runtime, Collector, CollectorCell, CollectorError, CollectorHandle, Command,
    ExtraCounters, RuntimeConfig,
};

use loghub_protocol::{CollectorState, CollectorStatus, HealthCheck};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorSetError {
    #[error("unknown collector '{0}'")]
    NotFound(String),
    #[error("{0}")]
    Rejected(String),
}

/// Registry of all collectors, built at startup.
#[derive(Default)]
pub struct CollectorSet {
    cells: BTreeMap<String, CollectorCell>,
}

impl CollectorSet {
    pub fn new() -> Self {
        CollectorSet::default()
    }

    pub fn register(&mut self, cell: CollectorCell) {
        self.cells.insert(cell.shared.name().to_owned(), cell);
    }

    pub fn names(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }

    /// `collector.toggle`: start or stop by name.
    pub async fn toggle(&self, name: &str, enabled: bool) -> Result<(), CollectorSetError> {
        let cell = self
            .cells
            .get(name)
            .ok_or_else(|| CollectorSetError::NotFound(name.to_owned()))?;
        let cmd = if enabled {
            Command::Start
        } else {
            Command::Stop
        };
        if cell.send(cmd).await {
            Ok(())
        } else {
            Err(CollectorSetError::Rejected(
                "collector task is gone".to_owned(),
            ))
        }
    }

    pub async fn pause(&self, name: &str) -> Result<(), CollectorSetError> {
        let cell = self
            .cells
            .get(name)
            .ok_or_else(|| CollectorSetError::NotFound(name.to_owned()))?;
        cell.send(Command::Pause).await;
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<(), CollectorSetError> {
        let cell = self
            .cells
            .get(name)
            .ok_or_else(|| CollectorSetError::NotFound(name.to_owned()))?;
        cell.send(Command::Resume).await;
        Ok(())
    }

    /// `collector.updateConfig`: apply a patch to one collector's config.
    pub async fn update_config(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), CollectorSetError> {
        let cell = self
            .cells
            .get(name)
            .ok_or_else(|| CollectorSetError::NotFound(name.to_owned()))?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        if !cell.send(Command::UpdateConfig(patch, tx)).await {
            return Err(CollectorSetError::Rejected(
                "collector task is gone".to_owned(),
            ));
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(CollectorSetError::Rejected(reason)),
            Err(_) => Err(CollectorSetError::Rejected(
                "collector task dropped the request".to_owned(),
            )),
        }
    }

    pub async fn start_all(&self) {
        for cell in self.cells.values() {
            cell.send(Command::Start).await;
        }
    }

    pub async fn stop_all(&self) {
        for cell in self.cells.values() {
            cell.send(Command::Stop).await;
        }
    }

    /// Per-collector status snapshot for `system.status`.
    pub fn status(&self) -> BTreeMap<String, CollectorStatus> {
        self.cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.status()))
            .collect()
    }

    /// Counters aggregated across all collectors.
    pub fn global_counters(&self) -> BTreeMap<String, u64> {
        let mut collected = 0u64;
        let mut errors = 0u64;
        let mut dropped = 0u64;
        for cell in self.cells.values() {
            let status = cell.status();
            collected += status.counters.records_collected;
            errors += status.counters.errors;
            dropped += status.counters.dropped_not_running;
        }
        let mut out = BTreeMap::new();
        out.insert("records_collected".to_owned(), collected);
        out.insert("errors".to_owned(), errors);
        out.insert("dropped_not_running".to_owned(), dropped);
        out
    }

    /// One health check entry per collector (`error` state is unhealthy).
    pub fn health_checks(&self) -> Vec<HealthCheck> {
        self.cells
            .iter()
            .map(|(name, cell)| {
                let status = cell.status();
                HealthCheck {
                    name: format!("collector:{name}"),
                    ok: status.state != CollectorState::Error,
                    detail: status.last_error,
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixture for collector tests: a real pipeline into an
    //! in-memory store, with the broker channel exposed for assertions.

    use super::CollectorSet;
    use crate::deadletter::DeadLetter;
    use crate::filter::{FilterConfig, Sanitizer};
    use crate::pipeline::{spawn_pipeline, Ingest, PipelineConfig};
    use crate::storage::LogStore;
    use loghub_protocol::{CollectorState, LogRecord};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch, Mutex};

    pub struct Harness {
        pub set: CollectorSet,
        pub ingest: Ingest,
        pub shutdown: watch::Receiver<bool>,
        pub broker_rx: mpsc::Receiver<Vec<LogRecord>>,
        pub store: Arc<Mutex<LogStore>>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    pub async fn running_set() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Mutex::new(LogStore::open_in_memory().expect("store")));
        let (broker_tx, broker_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest, _counters, _task) = spawn_pipeline(
            PipelineConfig::default(),
            Arc::new(Sanitizer::new(&FilterConfig::default())),
            store.clone(),
            broker_tx,
            DeadLetter::new(dir.path().join("dl.ndjson")),
            shutdown_rx.clone(),
        );
        Harness {
            set: CollectorSet::new(),
            ingest,
            shutdown: shutdown_rx,
            broker_rx,
            store,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    impl Harness {
        pub async fn start_and_wait(&self, name: &str) {
            self.set.toggle(name, true).await.expect("toggle");
            for _ in 0..200 {
                if self.set.status()[name].state == CollectorState::Running {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("collector {name} never reached running");
        }

        /// Receive `n` non-lifecycle records from the broker channel.
        pub async fn collect_records(&mut self, n: usize) -> Vec<LogRecord> {
            let mut out = Vec::new();
            while out.len() < n {
                let batch = tokio::time::timeout(Duration::from_secs(5), self.broker_rx.recv())
                    .await
                    .expect("timed out waiting for records")
                    .expect("broker channel open");
                out.extend(
                    batch
                        .into_iter()
                        .filter(|r| !r.tags.iter().any(|t| t == "lifecycle")),
                );
            }
            out
        }
    }
}
