//! Query/Analysis API: a thin validated layer over storage.
//!
//! Responsibilities: parameter validation, relative-time resolution,
//! assembling composite analysis responses, and the per-caller concurrency
//! cap — a FIFO semaphore (default 8 permits); waiters past the queue
//! deadline fail with `busy`.
//!
//! Every operation takes a deadline and an optional cancellation signal.
//! Reads run on a blocking thread against their own read-only connection;
//! deadline expiry or cancellation interrupts the running SQLite statement
//! and the operation reports `cancelled` with no partial result.

use crate::storage::{analysis, ReadStore, ResolvedQuery, ResolvedSearch, StorageError, TextQuery};
use chrono::{DateTime, Utc};
use loghub_protocol::{
    AnalysisKind, AnalysisParams, QueryFilter, QueryResult, SearchOptions, SearchResult,
    StatsResult, TimeExpr,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

/// Hard cap on `limit` for any single query.
pub const MAX_QUERY_LIMIT: u32 = 10_000;
/// Hard cap on `max_results` for a search.
pub const MAX_SEARCH_RESULTS: u32 = 1_000;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("busy: query concurrency cap reached")]
    Busy,
    #[error("cancelled")]
    Cancelled,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        if e.is_interrupted() {
            ApiError::Cancelled
        } else {
            match e {
                StorageError::Regex(msg) => ApiError::InvalidParams(format!("regex: {msg}")),
                other => ApiError::Internal(other.to_string()),
            }
        }
    }
}

/// Per-operation deadline and cancellation signal.
#[derive(Clone)]
pub struct OpContext {
    pub timeout: Duration,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl OpContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        OpContext {
            timeout,
            cancel: None,
        }
    }
}

pub struct QueryApi {
    db_path: PathBuf,
    semaphore: Arc<Semaphore>,
    queue_wait: Duration,
    pub default_timeout: Duration,
}

impl QueryApi {
    pub fn new(db_path: PathBuf, max_concurrent: usize, queue_wait: Duration, default_timeout: Duration) -> Self {
        QueryApi {
            db_path,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue_wait,
            default_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn query(&self, filter: &QueryFilter, ctx: OpContext) -> Result<QueryResult, ApiError> {
        let resolved = resolve_query(filter, Utc::now())?;
        self.run_read(ctx, move |store| store.query(&resolved)).await
    }

    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        ctx: OpContext,
    ) -> Result<SearchResult, ApiError> {
        let resolved = resolve_search(query, options, Utc::now())?;
        self.run_read(ctx, move |store| store.search(&resolved)).await
    }

    pub async fn stats(
        &self,
        timerange: Option<&TimeExpr>,
        ctx: OpContext,
    ) -> Result<StatsResult, ApiError> {
        let now = Utc::now();
        let (since_ms, until_ms) = resolve_range(timerange, now)?;
        let bucket_ms = bucket_for_range(until_ms - since_ms);
        self.run_read(ctx, move |store| store.stats(since_ms, until_ms, bucket_ms))
            .await
    }

    /// Dispatch one analysis kind and wrap its report as JSON.
    pub async fn analysis(
        &self,
        params: &AnalysisParams,
        ctx: OpContext,
    ) -> Result<serde_json::Value, ApiError> {
        let now = Utc::now();
        let (since_ms, until_ms) = resolve_range(params.timerange.as_ref(), now)?;
        let top_k = match params.top_k {
            None => 10,
            Some(k) if (1..=100).contains(&k) => k as usize,
            Some(k) => {
                return Err(ApiError::InvalidParams(format!(
                    "top_k must be in 1..=100, got {k}"
                )))
            }
        };
        let group_by = match &params.group_by {
            None => "method".to_owned(),
            Some(key)
                if !key.is_empty()
                    && key.len() <= 64
                    && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                key.clone()
            }
            Some(key) => {
                return Err(ApiError::InvalidParams(format!(
                    "group_by must be a metadata key name, got '{key}'"
                )))
            }
        };
        let bucket_ms = bucket_for_range(until_ms - since_ms);

        let kind = params.kind;
        self.run_read(ctx, move |store| {
            let report = match kind {
                AnalysisKind::Performance => serde_json::to_value(analysis::performance(
                    store, since_ms, until_ms, &group_by, top_k,
                )?),
                AnalysisKind::Errors => {
                    serde_json::to_value(analysis::errors(store, since_ms, until_ms, top_k)?)
                }
                AnalysisKind::Patterns => {
                    serde_json::to_value(analysis::patterns(store, since_ms, until_ms, top_k)?)
                }
                AnalysisKind::Trends => {
                    serde_json::to_value(analysis::trends(store, since_ms, until_ms, bucket_ms)?)
                }
                AnalysisKind::Anomalies => {
                    serde_json::to_value(analysis::anomalies(store, since_ms, until_ms, bucket_ms)?)
                }
            };
            report.map_err(StorageError::Encode)
        })
        .await
    }

    /// Replay query for a new subscription: the records a live client
    /// missed, oldest first, bounded by `limit`.
    pub async fn replay(
        &self,
        filter: &loghub_protocol::StreamFilter,
        since: &loghub_protocol::Since,
        limit: u32,
        ctx: OpContext,
    ) -> Result<Vec<loghub_protocol::LogRecord>, ApiError> {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(ApiError::InvalidParams(format!(
                "replay_limit must be in 1..={MAX_QUERY_LIMIT}, got {limit}"
            )));
        }
        let mut resolved = ResolvedQuery {
            sources: filter.sources.clone(),
            levels: filter.levels.clone(),
            min_level: filter.min_level,
            trace_id: filter.trace_id.clone(),
            tags: filter.tags.clone(),
            text: filter.text.as_deref().map(|raw| TextQuery::Substring {
                needle: raw.to_owned(),
                case_sensitive: false,
            }),
            limit,
            order: loghub_protocol::Order::Asc,
            ..ResolvedQuery::default()
        };
        match since {
            loghub_protocol::Since::Time(expr) => {
                resolved.since_ms = Some(expr.resolve(Utc::now()).timestamp_millis());
            }
            loghub_protocol::Since::LastId(last_id) => {
                resolved.min_id = Some(*last_id);
            }
        }
        self.run_read(ctx, move |store| store.query(&resolved).map(|r| r.logs))
            .await
    }

    /// Storage totals for `system.status` (uncapped; cheap index reads).
    pub async fn totals(&self) -> Result<(u64, u64), ApiError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(u64, u64), StorageError> {
            let store = ReadStore::open(&db_path)?;
            Ok((store.total_logs()?, store.live_size_bytes()?))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
    }

    // -----------------------------------------------------------------------
    // Read execution under the concurrency cap
    // -----------------------------------------------------------------------

    async fn run_read<T, F>(&self, ctx: OpContext, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&ReadStore) -> Result<T, StorageError> + Send + 'static,
    {
        let permit = match tokio::time::timeout(
            self.queue_wait,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ApiError::Internal("query semaphore closed".to_owned())),
            Err(_) => return Err(ApiError::Busy),
        };

        let store = ReadStore::open(&self.db_path)?;
        let interrupt = store.interrupt_handle();
        let mut task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&store)
        });

        let mut cancel = ctx.cancel;
        let completed = tokio::select! {
            res = &mut task => Some(res),
            () = tokio::time::sleep(ctx.timeout) => None,
            () = wait_cancelled(&mut cancel) => None,
        };

        match completed {
            Some(joined) => joined
                .map_err(|e| ApiError::Internal(format!("query task failed: {e}")))?
                .map_err(ApiError::from),
            None => {
                // Deadline or cancellation: interrupt the statement, reap the
                // task, and report cancelled — never a partial result.
                interrupt.interrupt();
                let _ = task.await;
                Err(ApiError::Cancelled)
            }
        }
    }
}

async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Validation / resolution
// ---------------------------------------------------------------------------

fn resolve_query(filter: &QueryFilter, now: DateTime<Utc>) -> Result<ResolvedQuery, ApiError> {
    let limit = match filter.limit {
        None => 100,
        Some(limit) if (1..=MAX_QUERY_LIMIT).contains(&limit) => limit,
        Some(limit) => {
            return Err(ApiError::InvalidParams(format!(
                "limit must be in 1..={MAX_QUERY_LIMIT}, got {limit}"
            )))
        }
    };
    let since_ms = filter
        .since
        .as_ref()
        .map(|expr| expr.resolve(now).timestamp_millis());
    let until_ms = filter
        .until
        .as_ref()
        .map(|expr| expr.resolve(now).timestamp_millis());
    if let (Some(since), Some(until)) = (since_ms, until_ms) {
        if since >= until {
            return Err(ApiError::InvalidParams(
                "since must be before until".to_owned(),
            ));
        }
    }
    Ok(ResolvedQuery {
        sources: filter.sources.clone(),
        levels: filter.levels.clone(),
        min_level: filter.min_level,
        since_ms,
        until_ms,
        trace_id: filter.trace_id.clone(),
        tags: filter.tags.clone(),
        text: filter
            .text
            .as_deref()
            .map(|raw| TextQuery::resolve(raw, false, false)),
        limit,
        offset: filter.offset.unwrap_or(0),
        order: filter.order.unwrap_or_default(),
        min_id: None,
    })
}

fn resolve_search(
    query: &str,
    options: &SearchOptions,
    now: DateTime<Utc>,
) -> Result<ResolvedSearch, ApiError> {
    if query.is_empty() {
        return Err(ApiError::InvalidParams("query must not be empty".to_owned()));
    }
    let limit = match options.max_results {
        None => 100,
        Some(n) if (1..=MAX_SEARCH_RESULTS).contains(&n) => n,
        Some(n) => {
            return Err(ApiError::InvalidParams(format!(
                "max_results must be in 1..={MAX_SEARCH_RESULTS}, got {n}"
            )))
        }
    };
    let context = options.context.unwrap_or(0);
    if context > 10 {
        return Err(ApiError::InvalidParams(
            "context must be at most 10".to_owned(),
        ));
    }
    for field in &options.fields {
        let valid = !field.is_empty()
            && field.len() <= 64
            && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ApiError::InvalidParams(format!(
                "invalid search field '{field}'"
            )));
        }
    }
    let since_ms = options
        .timerange
        .as_ref()
        .map(|expr| expr.resolve(now).timestamp_millis());
    Ok(ResolvedSearch {
        text: TextQuery::resolve(query, options.case_sensitive, options.regex),
        since_ms,
        until_ms: None,
        fields: options.fields.clone(),
        highlight: options.highlight,
        context,
        limit,
    })
}

/// Resolve an optional timerange into `[since, now)`; defaults to 1 hour.
fn resolve_range(
    timerange: Option<&TimeExpr>,
    now: DateTime<Utc>,
) -> Result<(i64, i64), ApiError> {
    let until_ms = now.timestamp_millis();
    let since_ms = match timerange {
        None => until_ms - 3_600_000,
        Some(expr) => expr.resolve(now).timestamp_millis(),
    };
    if since_ms >= until_ms {
        return Err(ApiError::InvalidParams(
            "timerange must start in the past".to_owned(),
        ));
    }
    Ok((since_ms, until_ms))
}

/// Bucket granularity by range: ≤1h → 1m, ≤24h → 5m, ≤7d → 1h, else 1d.
pub fn bucket_for_range(span_ms: i64) -> i64 {
    if span_ms <= 3_600_000 {
        60_000
    } else if span_ms <= 86_400_000 {
        300_000
    } else if span_ms <= 7 * 86_400_000 {
        3_600_000
    } else {
        86_400_000
    }
}
