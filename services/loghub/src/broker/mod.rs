//! Live stream broker: fans committed record batches out to subscribers.
//!
//! A single dispatch task consumes the pipeline's committed batches and
//! offers every record to every subscription's bounded buffer (non-blocking;
//! overflow policy per subscription). Each WS session runs its own sender
//! loop draining [`Subscription::next_event`].
//!
//! Subscriptions are held by id in a map; sessions hold only the id and an
//! `Arc` to their own subscription, never to the broker, so there is no
//! cycle. A dropped transport puts the subscription into a grace window
//! during which the buffer keeps accruing (bounded) and a reconnecting
//! client with the same id resumes without loss.

pub mod subscription;

pub use subscription::{CloseReason, SubEvent, Subscription};

use loghub_protocol::{LogRecord, OverflowPolicy, StreamFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Default per-subscription buffer capacity.
    pub default_buffer: usize,
    /// Reconnection grace window after a transport drop.
    pub grace: Duration,
    /// Grace windows are only granted when true (`auto_reconnect`).
    pub auto_reconnect: bool,
    pub max_subscribers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            default_buffer: 1_024,
            grace: Duration::from_secs(30),
            auto_reconnect: true,
            max_subscribers: 256,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("subscriber limit reached ({0})")]
    TooManySubscribers(usize),
    #[error("subscription id '{0}' is already in use")]
    DuplicateId(String),
}

/// Outcome of a subscribe call: fresh subscription or a grace-window resume.
#[derive(Debug)]
pub struct Subscribed {
    pub subscription: Arc<Subscription>,
    pub resumed: bool,
}

#[derive(Clone)]
pub struct Broker {
    subs: Arc<RwLock<HashMap<String, Arc<Subscription>>>>,
    cfg: Arc<BrokerConfig>,
    batches_dispatched: Arc<AtomicU64>,
}

impl Broker {
    /// Spawn the broker and its dispatch task over the committed-batch
    /// channel from the pipeline.
    pub fn spawn(
        cfg: BrokerConfig,
        mut batch_rx: mpsc::Receiver<Vec<LogRecord>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Broker {
        let broker = Broker {
            subs: Arc::new(RwLock::new(HashMap::new())),
            cfg: Arc::new(cfg),
            batches_dispatched: Arc::new(AtomicU64::new(0)),
        };
        let dispatch = broker.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    batch = batch_rx.recv() => {
                        let Some(batch) = batch else { break };
                        dispatch.dispatch(&batch).await;
                    }
                }
            }
            // Close every remaining subscription so sender loops exit.
            let subs = dispatch.subs.read().await;
            for sub in subs.values() {
                sub.close(CloseReason::Shutdown);
            }
            info!("stream broker stopped");
        });
        broker
    }

    async fn dispatch(&self, batch: &[LogRecord]) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        let subs = self.subs.read().await;
        if subs.is_empty() {
            return;
        }
        for sub in subs.values() {
            for record in batch {
                sub.publish(record);
            }
        }
    }

    /// Create a subscription, or resume one sitting in its grace window.
    pub async fn subscribe(
        &self,
        id: String,
        filter: StreamFilter,
        overflow: OverflowPolicy,
        buffer: Option<usize>,
    ) -> Result<Subscribed, SubscribeError> {
        let mut subs = self.subs.write().await;
        if let Some(existing) = subs.get(&id) {
            if existing.attach() {
                debug!(subscription = %id, "resumed within grace window");
                return Ok(Subscribed {
                    subscription: existing.clone(),
                    resumed: true,
                });
            }
            return Err(SubscribeError::DuplicateId(id));
        }
        if subs.len() >= self.cfg.max_subscribers {
            return Err(SubscribeError::TooManySubscribers(self.cfg.max_subscribers));
        }
        let sub = Arc::new(Subscription::new(
            id.clone(),
            filter,
            overflow,
            buffer.unwrap_or(self.cfg.default_buffer),
        ));
        subs.insert(id, sub.clone());
        Ok(Subscribed {
            subscription: sub,
            resumed: false,
        })
    }

    /// Explicit unsubscribe: close and remove immediately.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subs.write().await.remove(id);
        match removed {
            Some(sub) => {
                sub.close(CloseReason::Unsubscribed);
                true
            }
            None => false,
        }
    }

    /// Transport dropped: start the grace window (or destroy immediately
    /// when reconnection is disabled).
    pub async fn transport_dropped(&self, id: &str) {
        let sub = { self.subs.read().await.get(id).cloned() };
        let Some(sub) = sub else { return };

        if !self.cfg.auto_reconnect {
            self.subs.write().await.remove(id);
            sub.close(CloseReason::GraceExpired);
            return;
        }

        let generation = sub.detach();
        let broker = self.clone();
        let id = id.to_owned();
        let grace = self.cfg.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let expired = {
                let subs = broker.subs.read().await;
                subs.get(&id)
                    .is_some_and(|sub| sub.grace_expired_for(generation))
            };
            if expired {
                if let Some(sub) = broker.subs.write().await.remove(&id) {
                    sub.close(CloseReason::GraceExpired);
                    debug!(subscription = %id, "grace window expired, subscription destroyed");
                }
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subs.read().await.len()
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.batches_dispatched.load(Ordering::Relaxed)
    }

    pub async fn total_dropped(&self) -> u64 {
        self.subs
            .read()
            .await
            .values()
            .map(|sub| sub.total_dropped())
            .sum()
    }
}
