//! One live-stream subscription: a bounded FIFO of matching records with a
//! configurable overflow policy.
//!
//! The broker's dispatch task pushes; the subscription's sender task drains
//! via [`Subscription::next_event`]. The replay watermark suppresses
//! records already delivered during the replay phase, so nothing is
//! duplicated across the `live` transition.

use loghub_protocol::{LogRecord, OverflowPolicy, StreamFilter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::Notify;

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Buffer overflowed under the `close` policy.
    SlowConsumer,
    Unsubscribed,
    /// Transport never came back within the grace window.
    GraceExpired,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::GraceExpired => "grace_expired",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// What the sender task sees when draining.
#[derive(Debug)]
pub enum SubEvent {
    Records(Vec<LogRecord>),
    /// Records evicted under `drop_oldest` since the last drain.
    Dropped(u64),
    Closed(CloseReason),
}

#[derive(Debug)]
struct Buffer {
    queue: VecDeque<LogRecord>,
    dropped_pending: u64,
    closed: Option<CloseReason>,
}

#[derive(Debug)]
pub struct Subscription {
    id: String,
    filter: StreamFilter,
    overflow: OverflowPolicy,
    cap: usize,
    buffer: StdMutex<Buffer>,
    notify: Notify,
    /// Records with id <= watermark were already delivered by replay.
    replay_watermark: AtomicU64,
    /// Last record id handed to the transport.
    cursor: AtomicU64,
    /// False while the transport is gone (grace window running).
    attached: AtomicBool,
    /// Bumped on every re-attach so stale grace timers do not destroy a
    /// resumed subscription.
    generation: AtomicU64,
    total_dropped: AtomicU64,
}

/// Max records returned by one `next_event` drain (one `batch` frame).
const DRAIN_CHUNK: usize = 64;

impl Subscription {
    pub fn new(id: String, filter: StreamFilter, overflow: OverflowPolicy, cap: usize) -> Self {
        Subscription {
            id,
            filter,
            overflow,
            cap: cap.max(1),
            buffer: StdMutex::new(Buffer {
                queue: VecDeque::new(),
                dropped_pending: 0,
                closed: None,
            }),
            notify: Notify::new(),
            replay_watermark: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
            attached: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filter(&self) -> &StreamFilter {
        &self.filter
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn set_cursor(&self, id: u64) {
        self.cursor.store(id, Ordering::Relaxed);
    }

    /// Ids at or below this were delivered by the replay phase.
    pub fn set_replay_watermark(&self, id: u64) {
        self.replay_watermark.store(id, Ordering::Relaxed);
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Dispatch side
    // -----------------------------------------------------------------------

    /// Offer one committed record; non-blocking. Applies the overflow
    /// policy when the buffer is full.
    pub fn publish(&self, record: &LogRecord) {
        if !self.filter.matches(record) {
            return;
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.closed.is_some() {
            return;
        }
        if buffer.queue.len() >= self.cap {
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    buffer.queue.pop_front();
                    buffer.dropped_pending += 1;
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::Close => {
                    buffer.closed = Some(CloseReason::SlowConsumer);
                    drop(buffer);
                    self.notify.notify_one();
                    return;
                }
            }
        }
        buffer.queue.push_back(record.clone());
        drop(buffer);
        self.notify.notify_one();
    }

    /// Close from the broker side (unsubscribe, grace expiry, shutdown).
    pub fn close(&self, reason: CloseReason) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.closed.is_none() {
            buffer.closed = Some(reason);
        }
        drop(buffer);
        self.notify.notify_one();
    }

    // -----------------------------------------------------------------------
    // Sender side
    // -----------------------------------------------------------------------

    /// Wait for the next thing to send. A pending drop count is reported
    /// before any newer records.
    pub async fn next_event(&self) -> SubEvent {
        loop {
            let notified = self.notify.notified();
            {
                let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                if buffer.dropped_pending > 0 {
                    let n = buffer.dropped_pending;
                    buffer.dropped_pending = 0;
                    return SubEvent::Dropped(n);
                }
                if !buffer.queue.is_empty() {
                    let watermark = self.replay_watermark.load(Ordering::Relaxed);
                    let n = buffer.queue.len().min(DRAIN_CHUNK);
                    let records: Vec<LogRecord> = buffer
                        .queue
                        .drain(..n)
                        .filter(|r| r.id > watermark)
                        .collect();
                    if !records.is_empty() {
                        return SubEvent::Records(records);
                    }
                    // Everything drained was a replay duplicate; check again.
                    continue;
                }
                if let Some(reason) = buffer.closed {
                    return SubEvent::Closed(reason);
                }
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Reconnection grace
    // -----------------------------------------------------------------------

    /// Mark the transport gone; returns the generation for the grace timer.
    pub fn detach(&self) -> u64 {
        self.attached.store(false, Ordering::SeqCst);
        self.generation.load(Ordering::SeqCst)
    }

    /// Reattach a returning transport. Returns false if already attached
    /// (another live session owns this id) or closed.
    pub fn attach(&self) -> bool {
        if self
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
            .is_some()
        {
            return false;
        }
        if self
            .attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// True when the grace timer started at `generation` is still the
    /// relevant one (no reattach happened since).
    pub fn grace_expired_for(&self, generation: u64) -> bool {
        !self.is_attached() && self.generation.load(Ordering::SeqCst) == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loghub_protocol::{Level, Metadata};

    fn record(id: u64, level: Level, message: &str) -> LogRecord {
        LogRecord {
            id,
            timestamp: Utc::now(),
            level,
            source: "http_requests".to_owned(),
            message: message.to_owned(),
            metadata: Metadata::new(),
            tags: Vec::new(),
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn drop_oldest_keeps_the_tail_and_reports_the_count() {
        let sub = Subscription::new(
            "s1".to_owned(),
            StreamFilter::default(),
            OverflowPolicy::DropOldest,
            4,
        );
        for i in 1..=10 {
            sub.publish(&record(i, Level::Info, &format!("r{i}")));
        }

        match sub.next_event().await {
            SubEvent::Dropped(n) => assert_eq!(n, 6),
            other => panic!("expected dropped frame first, got {other:?}"),
        }
        match sub.next_event().await {
            SubEvent::Records(records) => {
                let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
                assert_eq!(ids, vec![7, 8, 9, 10]);
            }
            other => panic!("expected records, got {other:?}"),
        }
        assert_eq!(sub.total_dropped(), 6);
    }

    #[tokio::test]
    async fn close_policy_terminates_on_overflow() {
        let sub = Subscription::new(
            "s2".to_owned(),
            StreamFilter::default(),
            OverflowPolicy::Close,
            2,
        );
        sub.publish(&record(1, Level::Info, "a"));
        sub.publish(&record(2, Level::Info, "b"));
        sub.publish(&record(3, Level::Info, "c"));

        match sub.next_event().await {
            SubEvent::Records(records) => assert_eq!(records.len(), 2),
            other => panic!("expected records, got {other:?}"),
        }
        match sub.next_event().await {
            SubEvent::Closed(reason) => assert_eq!(reason, CloseReason::SlowConsumer),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_and_replay_watermark_suppress_records() {
        let sub = Subscription::new(
            "s3".to_owned(),
            StreamFilter {
                min_level: Some(Level::Warn),
                ..StreamFilter::default()
            },
            OverflowPolicy::DropOldest,
            16,
        );
        sub.set_replay_watermark(5);

        sub.publish(&record(4, Level::Error, "replayed already"));
        sub.publish(&record(6, Level::Info, "filtered out"));
        sub.publish(&record(7, Level::Error, "fresh"));

        match sub.next_event().await {
            SubEvent::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, 7);
            }
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[test]
    fn detach_attach_generation_guards_stale_grace_timers() {
        let sub = Subscription::new(
            "s4".to_owned(),
            StreamFilter::default(),
            OverflowPolicy::DropOldest,
            4,
        );
        let generation = sub.detach();
        assert!(sub.grace_expired_for(generation));
        assert!(sub.attach());
        assert!(!sub.grace_expired_for(generation), "reattach invalidates timer");
        assert!(!sub.attach(), "double attach is refused");
    }
}
