//! Analysis reports computed on top of the storage primitives.
//!
//! Scans are bounded: each report reads at most [`ANALYSIS_SCAN_CAP`] rows
//! from the requested window (newest first) and computes the rest in memory.

use super::store::{ReadStore, StorageError};
use chrono::{DateTime, Utc};
use loghub_protocol::{
    AnomaliesReport, AnomalyPoint, ErrorCluster, ErrorsReport, Level, PatternsReport, PerfGroup,
    PerformanceReport, TrendPoint, TrendsReport,
};
use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Max rows any single analysis scan will read.
pub const ANALYSIS_SCAN_CAP: u32 = 50_000;

/// Buckets whose error-rate z-score magnitude reaches this are anomalous.
const ZSCORE_THRESHOLD: f64 = 3.0;

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

/// Duration percentiles of the numeric `duration_ms` metadata field,
/// grouped by the `group_key` metadata field (falling back to `path`).
pub fn performance(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    group_key: &str,
    top_k: usize,
) -> Result<PerformanceReport, StorageError> {
    let mut stmt = store.conn().prepare_cached(
        "SELECT coalesce(json_extract(metadata, ?3), json_extract(metadata, '$.path'), 'unknown'),
                json_extract(metadata, '$.duration_ms')
         FROM logs
         WHERE ts_ms >= ?1 AND ts_ms < ?2 AND metadata IS NOT NULL
         ORDER BY ts_ms DESC LIMIT ?4",
    )?;
    let json_path = format!("$.{group_key}");
    let mut rows = stmt.query(params![since_ms, until_ms, json_path, ANALYSIS_SCAN_CAP])?;

    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut skipped: u64 = 0;
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let duration: Option<f64> = row.get(1)?;
        match duration {
            Some(d) if d.is_finite() => groups.entry(key).or_default().push(d),
            _ => skipped += 1,
        }
    }

    let mut report: Vec<PerfGroup> = groups
        .into_iter()
        .map(|(key, mut durations)| {
            durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let count = durations.len() as u64;
            let sum: f64 = durations.iter().sum();
            PerfGroup {
                key,
                count,
                mean_ms: sum / durations.len() as f64,
                min_ms: durations[0],
                max_ms: durations[durations.len() - 1],
                p50_ms: percentile(&durations, 50.0),
                p95_ms: percentile(&durations, 95.0),
                p99_ms: percentile(&durations, 99.0),
            }
        })
        .collect();
    report.sort_by(|a, b| b.count.cmp(&a.count));
    report.truncate(top_k);

    Ok(PerformanceReport {
        groups: report,
        skipped,
    })
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// ---------------------------------------------------------------------------
// Error / pattern clusters
// ---------------------------------------------------------------------------

/// Top-k clusters of ERROR/FATAL messages by normalized template.
pub fn errors(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    top_k: usize,
) -> Result<ErrorsReport, StorageError> {
    let total: i64 = store.conn().query_row(
        "SELECT COUNT(*) FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2 AND level >= ?3",
        params![since_ms, until_ms, Level::Error.rank()],
        |row| row.get(0),
    )?;
    let clusters = cluster_messages(store, since_ms, until_ms, Some(Level::Error), top_k)?;
    Ok(ErrorsReport {
        clusters,
        total_errors: total as u64,
    })
}

/// Top-k recurring message templates across all levels.
pub fn patterns(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    top_k: usize,
) -> Result<PatternsReport, StorageError> {
    let total: i64 = store.conn().query_row(
        "SELECT COUNT(*) FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2",
        params![since_ms, until_ms],
        |row| row.get(0),
    )?;
    let clusters = cluster_messages(store, since_ms, until_ms, None, top_k)?;
    Ok(PatternsReport {
        clusters,
        total_records: total as u64,
    })
}

fn cluster_messages(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    min_level: Option<Level>,
    top_k: usize,
) -> Result<Vec<ErrorCluster>, StorageError> {
    let min_rank = min_level.map_or(0, Level::rank);
    let mut stmt = store.conn().prepare_cached(
        "SELECT message, ts_ms FROM logs
         WHERE ts_ms >= ?1 AND ts_ms < ?2 AND level >= ?3
         ORDER BY ts_ms DESC LIMIT ?4",
    )?;
    let mut rows = stmt.query(params![since_ms, until_ms, min_rank, ANALYSIS_SCAN_CAP])?;

    struct Cluster {
        count: u64,
        example: String,
        last_seen_ms: i64,
    }
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let message: String = row.get(0)?;
        let ts_ms: i64 = row.get(1)?;
        let template = normalize_template(&message);
        let entry = clusters.entry(template).or_insert_with(|| Cluster {
            count: 0,
            example: message.clone(),
            last_seen_ms: ts_ms,
        });
        entry.count += 1;
        entry.last_seen_ms = entry.last_seen_ms.max(ts_ms);
    }

    let mut out: Vec<ErrorCluster> = clusters
        .into_iter()
        .map(|(template, c)| ErrorCluster {
            template,
            count: c.count,
            example: c.example,
            last_seen: DateTime::<Utc>::from_timestamp_millis(c.last_seen_ms)
                .unwrap_or_else(Utc::now),
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then(a.template.cmp(&b.template)));
    out.truncate(top_k);
    Ok(out)
}

/// Collapse variable fragments (uuids, hex ids, numbers) so messages that
/// differ only in identifiers share a template.
pub fn normalize_template(message: &str) -> String {
    static UUID_RE: OnceLock<regex::Regex> = OnceLock::new();
    static HEX_RE: OnceLock<regex::Regex> = OnceLock::new();
    static NUM_RE: OnceLock<regex::Regex> = OnceLock::new();

    let uuid_re = UUID_RE.get_or_init(|| {
        regex::Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .expect("uuid regex")
    });
    let hex_re = HEX_RE
        .get_or_init(|| regex::Regex::new(r"\b(?:0x)?[0-9a-fA-F]{8,}\b").expect("hex regex"));
    let num_re = NUM_RE.get_or_init(|| regex::Regex::new(r"\d+").expect("number regex"));

    let t = uuid_re.replace_all(message, "<uuid>");
    let t = hex_re.replace_all(&t, "<hex>");
    let t = num_re.replace_all(&t, "<n>");

    // Cap template length (char-safe) so pathological messages do not bloat
    // the cluster keys.
    match t.char_indices().nth(160) {
        Some((idx, _)) => t[..idx].to_owned(),
        None => t.into_owned(),
    }
}

// ---------------------------------------------------------------------------
// Trends & anomalies
// ---------------------------------------------------------------------------

/// Bucketed record counts with a trailing moving average (window 5).
pub fn trends(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    bucket_ms: i64,
) -> Result<TrendsReport, StorageError> {
    let counts = bucket_counts(store, since_ms, until_ms, bucket_ms, 0)?;
    let mut buckets = Vec::with_capacity(counts.len());
    let mut window: std::collections::VecDeque<u64> = std::collections::VecDeque::new();
    for (ts_ms, count) in counts {
        window.push_back(count);
        if window.len() > 5 {
            window.pop_front();
        }
        let moving_avg = window.iter().sum::<u64>() as f64 / window.len() as f64;
        buckets.push(TrendPoint {
            ts: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
            count,
            moving_avg,
        });
    }
    Ok(TrendsReport { buckets })
}

/// Z-score over the bucketed error-rate series; |z| >= 3 flags a bucket.
pub fn anomalies(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    bucket_ms: i64,
) -> Result<AnomaliesReport, StorageError> {
    let totals = bucket_counts(store, since_ms, until_ms, bucket_ms, 0)?;
    let errors = bucket_counts(store, since_ms, until_ms, bucket_ms, Level::Error.rank())?;
    let error_by_ts: BTreeMap<i64, u64> = errors.into_iter().collect();

    let rates: Vec<(i64, f64)> = totals
        .iter()
        .map(|(ts, total)| {
            let err = error_by_ts.get(ts).copied().unwrap_or(0);
            let rate = if *total == 0 {
                0.0
            } else {
                err as f64 / *total as f64
            };
            (*ts, rate)
        })
        .collect();

    let n = rates.len() as f64;
    let mean = if rates.is_empty() {
        0.0
    } else {
        rates.iter().map(|(_, r)| r).sum::<f64>() / n
    };
    let variance = if rates.len() < 2 {
        0.0
    } else {
        rates.iter().map(|(_, r)| (r - mean).powi(2)).sum::<f64>() / n
    };
    let stddev = variance.sqrt();

    let buckets = rates
        .into_iter()
        .map(|(ts_ms, rate)| {
            let zscore = if stddev > 0.0 {
                (rate - mean) / stddev
            } else {
                0.0
            };
            AnomalyPoint {
                ts: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
                error_rate: rate,
                zscore,
                anomalous: zscore.abs() >= ZSCORE_THRESHOLD,
            }
        })
        .collect();

    Ok(AnomaliesReport {
        buckets,
        mean_error_rate: mean,
        stddev,
    })
}

/// Counts per bucket for records at or above `min_rank`, with empty buckets
/// filled so the series is contiguous over `[since_ms, until_ms)`.
fn bucket_counts(
    store: &ReadStore,
    since_ms: i64,
    until_ms: i64,
    bucket_ms: i64,
    min_rank: u8,
) -> Result<Vec<(i64, u64)>, StorageError> {
    let mut stmt = store.conn().prepare_cached(
        "SELECT (ts_ms / ?3) * ?3 AS bucket, COUNT(*)
         FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2 AND level >= ?4
         GROUP BY bucket ORDER BY bucket ASC",
    )?;
    let mut rows = stmt.query(params![since_ms, until_ms, bucket_ms, min_rank])?;
    let mut sparse: BTreeMap<i64, u64> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let bucket: i64 = row.get(0)?;
        let count: i64 = row.get(1)?;
        sparse.insert(bucket, count as u64);
    }

    let first = (since_ms / bucket_ms) * bucket_ms;
    let mut out = Vec::new();
    let mut ts = first;
    while ts < until_ms {
        out.push((ts, sparse.get(&ts).copied().unwrap_or(0)));
        ts += bucket_ms;
        if out.len() > 10_000 {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_collapse_identifiers() {
        assert_eq!(
            normalize_template("request 42 failed after 500ms"),
            "request <n> failed after <n>ms"
        );
        assert_eq!(
            normalize_template("job 123e4567-e89b-12d3-a456-426614174000 crashed"),
            "job <uuid> crashed"
        );
        assert_eq!(
            normalize_template("session deadbeefcafe0042 expired"),
            "session <hex> expired"
        );
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let data: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&data, 50.0), 50.0);
        assert_eq!(percentile(&data, 95.0), 95.0);
        assert_eq!(percentile(&data, 99.0), 99.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
