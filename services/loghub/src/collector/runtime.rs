//! Shared collector runtime: one state machine for every collector kind.
//!
//! Each registered collector runs as an independent task owning its adapter.
//! Adapter calls (`on_start`, `on_stop`, `check_health`) return explicit
//! `Result`s that drive state transitions; panics inside an adapter are
//! caught, counted, and treated as errors, so one collector can never take
//! down another.
//!
//! ```text
//! stopped --start--> starting --ok--> running --stop--> stopping --ok--> stopped
//!                       |                 |                 \--err--> error
//!                       \--err--> error <-/
//! running --pause--> paused --resume--> running
//! error --(auto-retry < max)--> starting
//! ```

use crate::pipeline::Ingest;
use chrono::{SecondsFormat, Utc};
use loghub_protocol::{CollectorCounters, CollectorState, CollectorStatus, MetaValue, RecordDraft};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("start failed: {0}")]
    Start(String),
    #[error("stop failed: {0}")]
    Stop(String),
    #[error("health check failed: {0}")]
    Health(String),
    #[error("config rejected: {0}")]
    Config(String),
}

/// Behavior a collector kind plugs into the shared runtime.
///
/// Implementations must be idempotent with respect to the state machine:
/// `on_start` may be called again after a failed start, `on_stop` after a
/// failed stop.
pub trait Collector: Send + Sync + 'static {
    /// Registry key, e.g. `"mcp_calls"`.
    fn name(&self) -> &str;
    fn on_start(&mut self) -> Result<(), CollectorError>;
    fn on_stop(&mut self) -> Result<(), CollectorError>;
    /// Liveness probe; the default reports healthy.
    fn check_health(&self) -> Result<(), CollectorError> {
        Ok(())
    }
    /// Apply a config patch (`collector.updateConfig`); default rejects.
    fn apply_config(&mut self, _patch: &serde_json::Value) -> Result<(), CollectorError> {
        Err(CollectorError::Config(
            "collector accepts no config patches".to_owned(),
        ))
    }
}

/// Source-specific rollups surfaced in `system.status`, read outside the
/// runtime task.
pub trait ExtraCounters: Send + Sync {
    fn extras(&self) -> BTreeMap<String, serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Runtime config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub auto_restart: bool,
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// 0 disables the periodic health probe.
    pub health_check_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            auto_restart: true,
            retry_delay: Duration::from_secs(5),
            max_retries: 5,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state & counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub records_collected: AtomicU64,
    pub errors: AtomicU64,
    pub dropped_not_running: AtomicU64,
    /// Epoch millis of the last collected record (0 = never).
    pub last_activity_ms: AtomicU64,
}

struct Lifecycle {
    state: CollectorState,
    retries_used: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
    uptime_started_at: Option<Instant>,
}

/// State shared between the runtime task, collect handles, and status reads.
pub struct Shared {
    name: String,
    source: String,
    lifecycle: StdMutex<Lifecycle>,
    pub counters: RuntimeCounters,
}

impl Shared {
    fn new(name: String, source: String) -> Self {
        Shared {
            name,
            source,
            lifecycle: StdMutex::new(Lifecycle {
                state: CollectorState::Stopped,
                retries_used: 0,
                consecutive_failures: 0,
                last_error: None,
                uptime_started_at: None,
            }),
            counters: RuntimeCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> CollectorState {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Atomic snapshot for `system.status`.
    pub fn status(&self, extras: Option<&Arc<dyn ExtraCounters>>) -> CollectorStatus {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let last_activity_ms = self.counters.last_activity_ms.load(Ordering::Relaxed);
        CollectorStatus {
            state: lifecycle.state,
            retries_used: lifecycle.retries_used,
            last_error: lifecycle.last_error.clone(),
            uptime_seconds: lifecycle
                .uptime_started_at
                .map(|started| started.elapsed().as_secs()),
            counters: CollectorCounters {
                records_collected: self.counters.records_collected.load(Ordering::Relaxed),
                errors: self.counters.errors.load(Ordering::Relaxed),
                dropped_not_running: self.counters.dropped_not_running.load(Ordering::Relaxed),
                last_activity: (last_activity_ms > 0)
                    .then(|| {
                        chrono::DateTime::<Utc>::from_timestamp_millis(last_activity_ms as i64)
                            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
                    })
                    .flatten(),
                extras: extras.map(|e| e.extras()).unwrap_or_default(),
            },
        }
    }

    fn transition(&self, to: CollectorState) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lifecycle.state = to;
        match to {
            CollectorState::Running => {
                if lifecycle.uptime_started_at.is_none() {
                    lifecycle.uptime_started_at = Some(Instant::now());
                }
            }
            CollectorState::Stopped | CollectorState::Error => {
                lifecycle.uptime_started_at = None;
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Collect handle
// ---------------------------------------------------------------------------

/// Handle a source-side adapter uses to emit records.
///
/// Enriches every record with `collected_at` and a `collector:<name>` tag,
/// then forwards to the ingest pipeline. Records offered while the
/// collector is not `running` are dropped and counted.
#[derive(Clone)]
pub struct CollectorHandle {
    shared: Arc<Shared>,
    ingest: Ingest,
}

impl CollectorHandle {
    /// Returns false when the record was dropped because the collector was
    /// not in the `running` state.
    pub async fn collect(&self, mut draft: RecordDraft) -> bool {
        if self.shared.state() != CollectorState::Running {
            self.shared
                .counters
                .dropped_not_running
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let now = Utc::now();
        draft.metadata.insert(
            "collected_at".to_owned(),
            MetaValue::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let tag = format!("collector:{}", self.shared.name);
        if !draft.tags.contains(&tag) {
            draft.tags.push(tag);
        }
        draft.source = self.shared.source.clone();
        self.shared
            .counters
            .records_collected
            .fetch_add(1, Ordering::Relaxed);
        self.shared
            .counters
            .last_activity_ms
            .store(now.timestamp_millis() as u64, Ordering::Relaxed);
        self.ingest.submit(draft).await;
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == CollectorState::Running
    }

    /// Count a source-side error against this collector.
    pub fn note_error(&self) {
        self.shared.counters.errors.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Runtime commands & cell
// ---------------------------------------------------------------------------

pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    AutoRetry,
    UpdateConfig(serde_json::Value, oneshot::Sender<Result<(), String>>),
}

/// Registry entry: shared state plus the command channel into the task.
pub struct CollectorCell {
    pub shared: Arc<Shared>,
    pub extras: Option<Arc<dyn ExtraCounters>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl CollectorCell {
    pub async fn send(&self, cmd: Command) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }

    pub fn status(&self) -> CollectorStatus {
        self.shared.status(self.extras.as_ref())
    }
}

/// Spawn the runtime task for one collector.
pub fn spawn_runtime(
    collector: Box<dyn Collector>,
    source: String,
    extras: Option<Arc<dyn ExtraCounters>>,
    cfg: RuntimeConfig,
    ingest: Ingest,
    shutdown: watch::Receiver<bool>,
) -> (CollectorCell, CollectorHandle) {
    let shared = Arc::new(Shared::new(collector.name().to_owned(), source));
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let handle = CollectorHandle {
        shared: shared.clone(),
        ingest,
    };
    let cell = CollectorCell {
        shared: shared.clone(),
        extras,
        cmd_tx: cmd_tx.clone(),
    };
    tokio::spawn(run(collector, shared, cfg, cmd_tx, cmd_rx, shutdown));
    (cell, handle)
}

// ---------------------------------------------------------------------------
// Runtime task
// ---------------------------------------------------------------------------

async fn run(
    mut collector: Box<dyn Collector>,
    shared: Arc<Shared>,
    cfg: RuntimeConfig,
    cmd_tx: mpsc::Sender<Command>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let health_period = if cfg.health_check_interval.is_zero() {
        Duration::from_secs(3600)
    } else {
        cfg.health_check_interval
    };
    let mut health = tokio::time::interval(health_period);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    if shared.state() != CollectorState::Stopped {
                        do_stop(collector.as_mut(), &shared).await;
                    }
                    debug!(collector = shared.name(), "runtime task exiting");
                    return;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return };
                handle_command(cmd, collector.as_mut(), &shared, &cfg, &cmd_tx).await;
            }
            _ = health.tick(), if !cfg.health_check_interval.is_zero() => {
                if shared.state() == CollectorState::Running {
                    run_health_check(collector.as_ref(), &shared, &cfg, &cmd_tx).await;
                }
            }
        }
    }
}

async fn handle_command(
    cmd: Command,
    collector: &mut dyn Collector,
    shared: &Arc<Shared>,
    cfg: &RuntimeConfig,
    cmd_tx: &mpsc::Sender<Command>,
) {
    match cmd {
        Command::Start => {
            if matches!(
                shared.state(),
                CollectorState::Stopped | CollectorState::Error
            ) {
                {
                    let mut lifecycle =
                        shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                    lifecycle.retries_used = 0;
                    lifecycle.consecutive_failures = 0;
                }
                do_start(collector, shared, cfg, cmd_tx).await;
            }
        }
        Command::AutoRetry => {
            if shared.state() == CollectorState::Error {
                {
                    let mut lifecycle =
                        shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                    lifecycle.retries_used += 1;
                }
                do_start(collector, shared, cfg, cmd_tx).await;
            }
        }
        Command::Stop => {
            if matches!(
                shared.state(),
                CollectorState::Running | CollectorState::Paused | CollectorState::Error
            ) {
                do_stop(collector, shared).await;
            }
        }
        Command::Pause => {
            if shared.state() == CollectorState::Running {
                shared.transition(CollectorState::Paused);
                info!(collector = shared.name(), "paused");
            }
        }
        Command::Resume => {
            if shared.state() == CollectorState::Paused {
                shared.transition(CollectorState::Running);
                info!(collector = shared.name(), "resumed");
            }
        }
        Command::UpdateConfig(patch, reply) => {
            let result = catch(AssertUnwindSafe(|| collector.apply_config(&patch)))
                .map_err(|e| e.to_string());
            let _ = reply.send(result);
        }
    }
}

async fn do_start(
    collector: &mut dyn Collector,
    shared: &Arc<Shared>,
    cfg: &RuntimeConfig,
    cmd_tx: &mpsc::Sender<Command>,
) {
    shared.transition(CollectorState::Starting);
    match catch(AssertUnwindSafe(|| collector.on_start())) {
        Ok(()) => {
            {
                let mut lifecycle = shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                lifecycle.consecutive_failures = 0;
                lifecycle.last_error = None;
            }
            shared.transition(CollectorState::Running);
            info!(collector = shared.name(), "collector running");
        }
        Err(e) => {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            let failures = {
                let mut lifecycle = shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                lifecycle.last_error = Some(e.to_string());
                lifecycle.consecutive_failures += 1;
                lifecycle.consecutive_failures
            };
            shared.transition(CollectorState::Error);
            if cfg.auto_restart && failures <= cfg.max_retries {
                warn!(
                    collector = shared.name(),
                    error = %e,
                    attempt = failures,
                    "start failed, scheduling retry"
                );
                let cmd_tx = cmd_tx.clone();
                let delay = cfg.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = cmd_tx.send(Command::AutoRetry).await;
                });
            } else {
                error!(
                    collector = shared.name(),
                    error = %e,
                    "collector failed permanently"
                );
            }
        }
    }
}

async fn do_stop(collector: &mut dyn Collector, shared: &Arc<Shared>) {
    shared.transition(CollectorState::Stopping);
    match catch(AssertUnwindSafe(|| collector.on_stop())) {
        Ok(()) => {
            shared.transition(CollectorState::Stopped);
            info!(collector = shared.name(), "collector stopped");
        }
        Err(e) => {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            {
                let mut lifecycle = shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                lifecycle.last_error = Some(e.to_string());
            }
            shared.transition(CollectorState::Error);
            warn!(collector = shared.name(), error = %e, "stop failed");
        }
    }
}

async fn run_health_check(
    collector: &dyn Collector,
    shared: &Arc<Shared>,
    cfg: &RuntimeConfig,
    cmd_tx: &mpsc::Sender<Command>,
) {
    match catch(AssertUnwindSafe(|| collector.check_health())) {
        Ok(()) => {
            debug!(collector = shared.name(), "health check ok");
        }
        Err(e) => {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            let failures = {
                let mut lifecycle = shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                lifecycle.last_error = Some(e.to_string());
                lifecycle.consecutive_failures += 1;
                lifecycle.consecutive_failures
            };
            shared.transition(CollectorState::Error);
            warn!(collector = shared.name(), error = %e, "health check failed");
            if cfg.auto_restart && failures <= cfg.max_retries {
                let cmd_tx = cmd_tx.clone();
                let delay = cfg.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = cmd_tx.send(Command::AutoRetry).await;
                });
            }
        }
    }
}

/// Run an adapter call, converting panics into errors so a faulty collector
/// cannot unwind the runtime task.
fn catch<F>(f: AssertUnwindSafe<F>) -> Result<(), CollectorError>
where
    F: FnOnce() -> Result<(), CollectorError>,
{
    match std::panic::catch_unwind(f) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "collector panicked".to_owned());
            Err(CollectorError::Start(format!("panic: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::DeadLetter;
    use crate::filter::{FilterConfig, Sanitizer};
    use crate::pipeline::{spawn_pipeline, PipelineConfig};
    use crate::storage::LogStore;
    use loghub_protocol::Level;
    use tokio::sync::Mutex;

    struct FlakyCollector {
        fail_starts: u32,
        started: bool,
    }

    impl Collector for FlakyCollector {
        fn name(&self) -> &str {
            "flaky"
        }
        fn on_start(&mut self) -> Result<(), CollectorError> {
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return Err(CollectorError::Start("simulated".to_owned()));
            }
            self.started = true;
            Ok(())
        }
        fn on_stop(&mut self) -> Result<(), CollectorError> {
            self.started = false;
            Ok(())
        }
    }

    struct PanickyCollector;

    impl Collector for PanickyCollector {
        fn name(&self) -> &str {
            "panicky"
        }
        fn on_start(&mut self) -> Result<(), CollectorError> {
            panic!("boom");
        }
        fn on_stop(&mut self) -> Result<(), CollectorError> {
            Ok(())
        }
    }

    fn make_ingest() -> (Ingest, watch::Sender<bool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Mutex::new(LogStore::open_in_memory().expect("store")));
        let (broker_tx, mut broker_rx) = mpsc::channel(64);
        tokio::spawn(async move { while broker_rx.recv().await.is_some() {} });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest, _counters, _task) = spawn_pipeline(
            PipelineConfig::default(),
            Arc::new(Sanitizer::new(&FilterConfig::default())),
            store,
            broker_tx,
            DeadLetter::new(dir.path().join("dl.ndjson")),
            shutdown_rx,
        );
        (ingest, shutdown_tx, dir)
    }

    async fn wait_for_state(cell: &CollectorCell, want: CollectorState) {
        for _ in 0..200 {
            if cell.shared.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "collector never reached {want:?}, stuck at {:?}",
            cell.shared.state()
        );
    }

    #[tokio::test]
    async fn auto_restart_recovers_after_transient_start_failures() {
        let (ingest, _shutdown, _dir) = make_ingest();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let (cell, _handle) = spawn_runtime(
            Box::new(FlakyCollector {
                fail_starts: 2,
                started: false,
            }),
            "mcp_calls".to_owned(),
            None,
            RuntimeConfig {
                retry_delay: Duration::from_millis(10),
                ..RuntimeConfig::default()
            },
            ingest,
            sd_rx,
        );

        assert!(cell.send(Command::Start).await);
        wait_for_state(&cell, CollectorState::Running).await;
        let status = cell.status();
        assert_eq!(status.retries_used, 2);
        assert_eq!(status.counters.errors, 2);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_leaves_the_collector_in_error() {
        let (ingest, _shutdown, _dir) = make_ingest();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let (cell, _handle) = spawn_runtime(
            Box::new(FlakyCollector {
                fail_starts: 100,
                started: false,
            }),
            "mcp_calls".to_owned(),
            None,
            RuntimeConfig {
                retry_delay: Duration::from_millis(5),
                max_retries: 2,
                ..RuntimeConfig::default()
            },
            ingest,
            sd_rx,
        );

        cell.send(Command::Start).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = cell.status();
        assert_eq!(status.state, CollectorState::Error);
        assert_eq!(status.retries_used, 2);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn panic_in_on_start_is_isolated_and_reported() {
        let (ingest, _shutdown, _dir) = make_ingest();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let (cell, _handle) = spawn_runtime(
            Box::new(PanickyCollector),
            "websocket".to_owned(),
            None,
            RuntimeConfig {
                auto_restart: false,
                ..RuntimeConfig::default()
            },
            ingest,
            sd_rx,
        );

        cell.send(Command::Start).await;
        wait_for_state(&cell, CollectorState::Error).await;
        let status = cell.status();
        assert!(status.last_error.expect("error").contains("panic"));
        // The runtime task survived the panic and still answers commands.
        assert!(cell.send(Command::Stop).await);
        wait_for_state(&cell, CollectorState::Stopped).await;
    }

    #[tokio::test]
    async fn records_offered_while_not_running_are_dropped_and_counted() {
        let (ingest, _shutdown, _dir) = make_ingest();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let (cell, handle) = spawn_runtime(
            Box::new(FlakyCollector {
                fail_starts: 0,
                started: false,
            }),
            "websocket".to_owned(),
            None,
            RuntimeConfig::default(),
            ingest,
            sd_rx,
        );

        assert!(
            !handle
                .collect(RecordDraft::new(Level::Info, "websocket", "early"))
                .await
        );
        assert_eq!(cell.status().counters.dropped_not_running, 1);

        cell.send(Command::Start).await;
        wait_for_state(&cell, CollectorState::Running).await;
        assert!(
            handle
                .collect(RecordDraft::new(Level::Info, "websocket", "now running"))
                .await
        );
        assert_eq!(cell.status().counters.records_collected, 1);

        cell.send(Command::Pause).await;
        wait_for_state(&cell, CollectorState::Paused).await;
        assert!(
            !handle
                .collect(RecordDraft::new(Level::Info, "websocket", "paused"))
                .await
        );
        // Counters survive pause/resume.
        cell.send(Command::Resume).await;
        wait_for_state(&cell, CollectorState::Running).await;
        assert_eq!(cell.status().counters.records_collected, 1);
        assert_eq!(cell.status().counters.dropped_not_running, 2);
    }
}
