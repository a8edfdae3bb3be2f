use crate::record::{rfc3339_millis, Level, LogRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Time expressions
// ---------------------------------------------------------------------------

/// A point in time, absolute (RFC3339) or relative to "now" (`"90s"`,
/// `"15m"`, `"1h"`, `"7d"`).
///
/// Relative forms resolve at query time against the caller's wall clock,
/// so the same filter re-run later covers a shifted window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeExpr {
    Absolute(DateTime<Utc>),
    Relative(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid time expression '{0}' (want RFC3339 or e.g. \"15m\", \"1h\", \"7d\")")]
pub struct TimeExprError(pub String);

impl TimeExpr {
    /// Resolve against `now`; relative expressions mean "now minus span".
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeExpr::Absolute(dt) => *dt,
            TimeExpr::Relative(span) => now - *span,
        }
    }
}

impl FromStr for TimeExpr {
    type Err = TimeExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(TimeExpr::Absolute(dt.with_timezone(&Utc)));
        }
        // Relative: <digits><unit>, unit in {ms, s, m, h, d}.
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .filter(|&i| i > 0)
            .ok_or_else(|| TimeExprError(s.to_owned()))?;
        let (num, unit) = s.split_at(split);
        let n: i64 = num.parse().map_err(|_| TimeExprError(s.to_owned()))?;
        let span = match unit {
            "ms" => Duration::milliseconds(n),
            "s" => Duration::seconds(n),
            "m" => Duration::minutes(n),
            "h" => Duration::hours(n),
            "d" => Duration::days(n),
            _ => return Err(TimeExprError(s.to_owned())),
        };
        Ok(TimeExpr::Relative(span))
    }
}

impl fmt::Display for TimeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeExpr::Absolute(dt) => {
                f.write_str(&dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            }
            TimeExpr::Relative(span) => {
                let ms = span.num_milliseconds();
                if ms % 86_400_000 == 0 {
                    write!(f, "{}d", ms / 86_400_000)
                } else if ms % 3_600_000 == 0 {
                    write!(f, "{}h", ms / 3_600_000)
                } else if ms % 60_000 == 0 {
                    write!(f, "{}m", ms / 60_000)
                } else if ms % 1000 == 0 {
                    write!(f, "{}s", ms / 1000)
                } else {
                    write!(f, "{ms}ms")
                }
            }
        }
    }
}

impl Serialize for TimeExpr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeExpr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Result ordering on `(timestamp, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

/// Filter for `log.query`.
///
/// `since` is inclusive, `until` exclusive.  `levels` filters by set
/// membership, `min_level` by severity threshold; when both are present
/// the result is their intersection.  `text` runs full-text search unless
/// it is a `/…/` regex literal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<TimeExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<TimeExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// All listed tags must be present on a matching record.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

/// `log.query` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub logs: Vec<LogRecord>,
    pub total_matches: u64,
    /// Set when the query bypassed indices (regex scan hit its window cap).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub approximate: bool,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Options for `log.search`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timerange: Option<TimeExpr>,
    /// Records of surrounding context to return per match (0 = none).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<u32>,
    pub highlight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    /// Extra metadata fields to search in addition to `message`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub case_sensitive: bool,
    pub regex: bool,
}

/// One highlighted fragment; match spans are wrapped in `<mark>` tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub record_id: u64,
    pub highlighted_text: String,
}

/// `log.search` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub logs: Vec<LogRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<Highlight>,
    pub total_matches: u64,
    pub search_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// One time bucket in the stats distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsBucket {
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    pub count: u64,
    pub by_level: BTreeMap<String, u64>,
}

/// `log.stats` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResult {
    pub total_logs: u64,
    pub by_level: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub time_distribution: Vec<StatsBucket>,
    pub error_rate: f64,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Performance,
    Errors,
    Patterns,
    Trends,
    Anomalies,
}

/// Parameters for `log.analysis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub kind: AnalysisKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timerange: Option<TimeExpr>,
    /// Metadata key to group performance results by (default `"method"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    /// Cluster/report size cap (default 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

/// One group in a performance report; durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfGroup {
    pub key: String,
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub groups: Vec<PerfGroup>,
    /// Records inspected that carried no numeric `duration_ms`.
    pub skipped: u64,
}

/// One cluster of messages sharing a normalized template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCluster {
    pub template: String,
    pub count: u64,
    pub example: String,
    #[serde(with = "rfc3339_millis")]
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorsReport {
    pub clusters: Vec<ErrorCluster>,
    pub total_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternsReport {
    pub clusters: Vec<ErrorCluster>,
    pub total_records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    pub count: u64,
    pub moving_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendsReport {
    pub buckets: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPoint {
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    pub error_rate: f64,
    pub zscore: f64,
    pub anomalous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomaliesReport {
    pub buckets: Vec<AnomalyPoint>,
    pub mean_error_rate: f64,
    pub stddev: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_expr_parses_relative_and_absolute_forms() {
        assert_eq!(
            "15m".parse::<TimeExpr>(),
            Ok(TimeExpr::Relative(Duration::minutes(15)))
        );
        assert_eq!(
            "7d".parse::<TimeExpr>(),
            Ok(TimeExpr::Relative(Duration::days(7)))
        );
        assert_eq!(
            "90s".parse::<TimeExpr>(),
            Ok(TimeExpr::Relative(Duration::seconds(90)))
        );
        let abs = "2026-01-02T03:04:05.678Z".parse::<TimeExpr>().expect("abs");
        match abs {
            TimeExpr::Absolute(dt) => assert_eq!(dt.timestamp_millis(), 1_767_323_045_678),
            TimeExpr::Relative(_) => panic!("expected absolute"),
        }
        assert!("".parse::<TimeExpr>().is_err());
        assert!("h1".parse::<TimeExpr>().is_err());
        assert!("10y".parse::<TimeExpr>().is_err());
    }

    #[test]
    fn relative_time_resolves_against_supplied_now() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        let expr = "1h".parse::<TimeExpr>().expect("parse");
        assert_eq!(
            expr.resolve(now),
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("parse")
                .with_timezone(&Utc)
        );
    }

    #[test]
    fn query_filter_defaults_deserialize_from_empty_object() {
        let filter: QueryFilter = serde_json::from_str("{}").expect("parse");
        assert_eq!(filter, QueryFilter::default());
        assert_eq!(filter.order.unwrap_or_default(), Order::Desc);
    }

    #[test]
    fn approximate_flag_is_omitted_when_false() {
        let result = QueryResult {
            logs: vec![],
            total_matches: 0,
            approximate: false,
        };
        let json = serde_json::to_value(&result).expect("serialize");
        assert!(json.get("approximate").is_none());
    }
}
