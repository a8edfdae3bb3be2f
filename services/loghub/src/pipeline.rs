//! Ingest pipeline: the single writer path to storage.
//!
//! Multi-producer, single-consumer. Producers (collectors and direct API
//! writers) offer records into a bounded queue; when the queue is full they
//! block up to a deadline, then the oldest buffered record is evicted and
//! the new one enqueued — producers learn of this via a non-error
//! [`Enqueued::DroppedOldest`] signal, never a failure.
//!
//! The consumer task applies the sanitizer chain, re-stamps out-of-order
//! same-source timestamps so `timestamp` stays non-decreasing with `id` per
//! source, groups survivors into batches (up to `max_batch` records or
//! `max_batch_latency`, whichever first), commits to storage, and publishes
//! committed slices to the stream broker. Failed commits retry with
//! exponential backoff and land in the dead-letter file after exhaustion.

use crate::deadletter::DeadLetter;
use crate::filter::{DropReason, FilterOutcome, Sanitizer};
use crate::storage::LogStore;
use chrono::{DateTime, Utc};
use loghub_protocol::{LogRecord, RecordDraft};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Distinct trace ids tracked before the set stops growing.
const TRACE_SET_CAP: usize = 10_000;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded queue capacity (default 10 000).
    pub buffer: usize,
    /// How long a producer blocks on a full queue before drop-oldest.
    pub enqueue_deadline: Duration,
    pub max_batch: usize,
    pub max_batch_latency: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub retry_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            buffer: 10_000,
            enqueue_deadline: Duration::from_millis(100),
            max_batch: 500,
            max_batch_latency: Duration::from_millis(50),
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            retry_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes and counters
// ---------------------------------------------------------------------------

/// Producer-side enqueue signal. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// The queue was full past the deadline; the oldest buffered record was
    /// evicted to make room for this one.
    DroppedOldest,
}

/// Final fate of one offered record, delivered on its ack channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Stored(u64),
    DroppedFilter,
    DroppedRateLimited,
    /// Evicted from the queue by a later producer's drop-oldest.
    DroppedBuffer,
    /// Commit retries exhausted; record went to the dead-letter file.
    StorageUnavailable,
}

#[derive(Debug, Default)]
pub struct IngestCounters {
    pub accepted: AtomicU64,
    pub dropped_buffer: AtomicU64,
    pub dead_letter: AtomicU64,
    pub storage_retries: AtomicU64,
    pub batches_committed: AtomicU64,
    pub records_committed: AtomicU64,
    pub distinct_trace_ids: AtomicU64,
}

impl IngestCounters {
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        let mut out = std::collections::BTreeMap::new();
        out.insert("accepted".to_owned(), self.accepted.load(Ordering::Relaxed));
        out.insert(
            "dropped_buffer".to_owned(),
            self.dropped_buffer.load(Ordering::Relaxed),
        );
        out.insert(
            "dead_letter".to_owned(),
            self.dead_letter.load(Ordering::Relaxed),
        );
        out.insert(
            "storage_retries".to_owned(),
            self.storage_retries.load(Ordering::Relaxed),
        );
        out.insert(
            "batches_committed".to_owned(),
            self.batches_committed.load(Ordering::Relaxed),
        );
        out.insert(
            "records_committed".to_owned(),
            self.records_committed.load(Ordering::Relaxed),
        );
        out.insert(
            "distinct_trace_ids".to_owned(),
            self.distinct_trace_ids.load(Ordering::Relaxed),
        );
        out
    }
}

// ---------------------------------------------------------------------------
// Bounded queue with drop-oldest overflow
// ---------------------------------------------------------------------------

struct IngestItem {
    record: LogRecord,
    ack: Option<oneshot::Sender<ItemOutcome>>,
}

struct IngestQueue {
    items: StdMutex<VecDeque<IngestItem>>,
    cap: usize,
    deadline: Duration,
    not_empty: Notify,
    not_full: Notify,
    counters: Arc<IngestCounters>,
}

impl IngestQueue {
    /// Offer one item; blocks up to the deadline when full, then evicts the
    /// oldest buffered item (signalling its ack) and enqueues this one.
    async fn offer(&self, item: IngestItem) -> Enqueued {
        let deadline = Instant::now() + self.deadline;
        let mut item = Some(item);
        loop {
            {
                let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if items.len() < self.cap {
                    items.push_back(item.take().expect("item present until enqueued"));
                    drop(items);
                    self.not_empty.notify_one();
                    return Enqueued::Accepted;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let evicted = {
                    let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                    // The consumer may have drained while we waited.
                    let evicted = if items.len() >= self.cap {
                        items.pop_front()
                    } else {
                        None
                    };
                    items.push_back(item.take().expect("item present until enqueued"));
                    evicted
                };
                self.not_empty.notify_one();
                let Some(evicted) = evicted else {
                    return Enqueued::Accepted;
                };
                self.counters.dropped_buffer.fetch_add(1, Ordering::Relaxed);
                if let Some(ack) = evicted.ack {
                    let _ = ack.send(ItemOutcome::DroppedBuffer);
                }
                return Enqueued::DroppedOldest;
            }
            let _ = tokio::time::timeout(deadline - now, self.not_full.notified()).await;
        }
    }

    /// Wait for at least one item.
    async fn recv(&self) -> IngestItem {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.not_full.notify_one();
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Pop up to `max` items without waiting.
    fn try_drain(&self, max: usize) -> Vec<IngestItem> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let n = items.len().min(max);
        let drained: Vec<IngestItem> = items.drain(..n).collect();
        drop(items);
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ---------------------------------------------------------------------------
// Producer handle
// ---------------------------------------------------------------------------

/// Cloneable producer handle into the pipeline.
#[derive(Clone)]
pub struct Ingest {
    queue: Arc<IngestQueue>,
}

impl Ingest {
    /// Fire-and-forget submission (collectors).
    pub async fn submit(&self, draft: RecordDraft) -> Enqueued {
        let record = materialize(draft, Utc::now());
        self.queue
            .offer(IngestItem { record, ack: None })
            .await
    }

    /// Submission that reports the record's final fate (API writers).
    pub async fn submit_with_ack(
        &self,
        draft: RecordDraft,
    ) -> (Enqueued, oneshot::Receiver<ItemOutcome>) {
        let record = materialize(draft, Utc::now());
        let (tx, rx) = oneshot::channel();
        let enqueued = self
            .queue
            .offer(IngestItem {
                record,
                ack: Some(tx),
            })
            .await;
        (enqueued, rx)
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }
}

/// Stamp ingest time when the source supplied none; truncate to millis.
fn materialize(draft: RecordDraft, now: DateTime<Utc>) -> LogRecord {
    LogRecord {
        id: 0,
        timestamp: draft.timestamp.unwrap_or(now),
        level: draft.level,
        source: draft.source,
        message: draft.message,
        metadata: draft.metadata,
        tags: draft.tags,
        trace_id: draft.trace_id,
    }
    .truncated_to_millis()
}

// ---------------------------------------------------------------------------
// Pipeline task
// ---------------------------------------------------------------------------

/// Spawn the ingest pipeline task; returns the producer handle and counters.
pub fn spawn_pipeline(
    cfg: PipelineConfig,
    sanitizer: Arc<Sanitizer>,
    store: Arc<Mutex<LogStore>>,
    broker_tx: mpsc::Sender<Vec<LogRecord>>,
    dead_letter: DeadLetter,
    shutdown: watch::Receiver<bool>,
) -> (Ingest, Arc<IngestCounters>, tokio::task::JoinHandle<()>) {
    let counters = Arc::new(IngestCounters::default());
    let queue = Arc::new(IngestQueue {
        items: StdMutex::new(VecDeque::with_capacity(cfg.buffer.min(1024))),
        cap: cfg.buffer.max(1),
        deadline: cfg.enqueue_deadline,
        not_empty: Notify::new(),
        not_full: Notify::new(),
        counters: counters.clone(),
    });
    let ingest = Ingest {
        queue: queue.clone(),
    };
    let task_counters = counters.clone();
    let handle = tokio::spawn(run_pipeline(
        cfg,
        queue,
        sanitizer,
        store,
        broker_tx,
        dead_letter,
        task_counters,
        shutdown,
    ));
    (ingest, counters, handle)
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    cfg: PipelineConfig,
    queue: Arc<IngestQueue>,
    sanitizer: Arc<Sanitizer>,
    store: Arc<Mutex<LogStore>>,
    broker_tx: mpsc::Sender<Vec<LogRecord>>,
    dead_letter: DeadLetter,
    counters: Arc<IngestCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        buffer = cfg.buffer,
        max_batch = cfg.max_batch,
        "ingest pipeline started"
    );
    // Per-source high-water timestamp for monotonic re-stamping.
    let mut last_ts: HashMap<String, i64> = HashMap::new();
    let mut traces: HashSet<String> = HashSet::new();

    loop {
        let first = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A closed channel means the service is gone; treat as stop.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            item = queue.recv() => item,
        };

        let mut batch = vec![first];
        let deadline = tokio::time::sleep(cfg.max_batch_latency);
        tokio::pin!(deadline);
        while batch.len() < cfg.max_batch {
            let drained = queue.try_drain(cfg.max_batch - batch.len());
            if !drained.is_empty() {
                batch.extend(drained);
                continue;
            }
            tokio::select! {
                biased;
                () = &mut deadline => break,
                item = queue.recv() => batch.push(item),
            }
        }

        process_batch(
            &cfg,
            batch,
            &sanitizer,
            &store,
            &broker_tx,
            &dead_letter,
            &counters,
            &mut last_ts,
            &mut traces,
        )
        .await;
    }

    // Drain whatever is still queued and flush it as final batches.
    loop {
        let rest = queue.try_drain(cfg.max_batch);
        if rest.is_empty() {
            break;
        }
        process_batch(
            &cfg,
            rest,
            &sanitizer,
            &store,
            &broker_tx,
            &dead_letter,
            &counters,
            &mut last_ts,
            &mut traces,
        )
        .await;
    }
    info!("ingest pipeline stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_batch(
    cfg: &PipelineConfig,
    batch: Vec<IngestItem>,
    sanitizer: &Sanitizer,
    store: &Arc<Mutex<LogStore>>,
    broker_tx: &mpsc::Sender<Vec<LogRecord>>,
    dead_letter: &DeadLetter,
    counters: &Arc<IngestCounters>,
    last_ts: &mut HashMap<String, i64>,
    traces: &mut HashSet<String>,
) {
    let mut records: Vec<LogRecord> = Vec::with_capacity(batch.len());
    let mut acks: Vec<Option<oneshot::Sender<ItemOutcome>>> = Vec::with_capacity(batch.len());

    let now = std::time::Instant::now();
    for item in batch {
        match sanitizer.apply(item.record, now) {
            FilterOutcome::Keep(record) => {
                let mut record = *record;
                // Re-stamp out-of-order arrivals from the same source.
                let ts = record.timestamp.timestamp_millis();
                let high = last_ts.entry(record.source.clone()).or_insert(ts);
                if ts < *high {
                    if let Some(dt) = DateTime::<Utc>::from_timestamp_millis(*high) {
                        record.timestamp = dt;
                    }
                } else {
                    *high = ts;
                }
                if let Some(trace) = &record.trace_id {
                    if traces.len() < TRACE_SET_CAP && traces.insert(trace.clone()) {
                        counters.distinct_trace_ids.fetch_add(1, Ordering::Relaxed);
                    }
                }
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                records.push(record);
                acks.push(item.ack);
            }
            FilterOutcome::Drop(reason) => {
                if let Some(ack) = item.ack {
                    let outcome = match reason {
                        DropReason::Pattern => ItemOutcome::DroppedFilter,
                        DropReason::RateLimited => ItemOutcome::DroppedRateLimited,
                    };
                    let _ = ack.send(outcome);
                }
            }
        }
    }

    if records.is_empty() {
        return;
    }

    // Commit with exponential backoff; dead-letter after exhaustion.
    let mut attempt = 0u32;
    let mut backoff = cfg.retry_base;
    loop {
        let result = {
            let mut store = store.lock().await;
            store.append_batch(&mut records)
        };
        match result {
            Ok(ids) => {
                counters.batches_committed.fetch_add(1, Ordering::Relaxed);
                counters
                    .records_committed
                    .fetch_add(ids.len() as u64, Ordering::Relaxed);
                for (ack, id) in acks.into_iter().zip(ids) {
                    if let Some(ack) = ack {
                        let _ = ack.send(ItemOutcome::Stored(id));
                    }
                }
                debug!(n = records.len(), "batch committed");
                if broker_tx.send(records).await.is_err() {
                    debug!("stream broker is gone; live fan-out skipped");
                }
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= cfg.retry_attempts {
                    error!(error = %e, n = records.len(), "commit retries exhausted, dead-lettering batch");
                    match dead_letter.append(&records) {
                        Ok(written) => {
                            counters.dead_letter.fetch_add(written, Ordering::Relaxed);
                        }
                        Err(io) => {
                            error!(error = %io, "dead-letter write failed; batch lost");
                        }
                    }
                    for ack in acks.into_iter().flatten() {
                        let _ = ack.send(ItemOutcome::StorageUnavailable);
                    }
                    return;
                }
                counters.storage_retries.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, attempt, "commit failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(cfg.retry_cap);
            }
        }
    }
}
