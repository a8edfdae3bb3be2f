//! Record sanitizer chain, applied between collection and storage.
//!
//! Order: drop patterns, field redaction, size bounds, rate limiting,
//! stack-trace trimming. Pure aside from counter increments; safe to call
//! concurrently. The same redaction walk is re-run on outbound error
//! payloads so detail objects never carry secrets.

use loghub_protocol::{Level, LogRecord, MetaValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Replacement value for sensitive metadata fields.
pub const REDACTED: &str = "[REDACTED]";
/// Marker appended to truncated fields.
pub const TRUNCATED_MARKER: &str = "…[TRUNCATED]";
/// Stack traces on error records are trimmed to this many chars.
const STACK_TRIM_CHARS: usize = 497;
/// Individual oversized string values are cut to this many bytes before
/// whole metadata entries start being dropped.
const STRING_VALUE_CAP: usize = 4096;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Case-insensitive substrings; a matching message drops the record.
    pub drop_patterns: Vec<String>,
    /// Case-insensitive substrings matched against metadata key names.
    pub sensitive_keys: Vec<String>,
    /// Max message length in bytes (default 64 KiB).
    pub max_message_bytes: usize,
    /// Max serialized metadata length in bytes (default 256 KiB).
    pub max_metadata_bytes: usize,
    /// Token bucket refill per second, per source (0 = disabled).
    pub rate_limit_rps: u32,
    /// Token bucket burst capacity (0 = disabled).
    pub burst_limit: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            drop_patterns: Vec::new(),
            sensitive_keys: default_sensitive_keys(),
            max_message_bytes: 64 * 1024,
            max_metadata_bytes: 256 * 1024,
            rate_limit_rps: 0,
            burst_limit: 0,
        }
    }
}

pub fn default_sensitive_keys() -> Vec<String> {
    ["password", "token", "secret", "key", "auth"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FilterCounters {
    pub dropped_by_filter: AtomicU64,
    pub dropped_rate_limited: AtomicU64,
    pub truncated: AtomicU64,
    pub redacted_fields: AtomicU64,
}

impl FilterCounters {
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        let mut out = std::collections::BTreeMap::new();
        out.insert(
            "dropped_by_filter".to_owned(),
            self.dropped_by_filter.load(Ordering::Relaxed),
        );
        out.insert(
            "dropped_rate_limited".to_owned(),
            self.dropped_rate_limited.load(Ordering::Relaxed),
        );
        out.insert("truncated".to_owned(), self.truncated.load(Ordering::Relaxed));
        out.insert(
            "redacted_fields".to_owned(),
            self.redacted_fields.load(Ordering::Relaxed),
        );
        out
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn try_take(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Sanitizer
// ---------------------------------------------------------------------------

/// Why a record was dropped by the filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Pattern,
    RateLimited,
}

/// Outcome of running one record through the chain.
#[derive(Debug)]
pub enum FilterOutcome {
    Keep(Box<LogRecord>),
    Drop(DropReason),
}

/// Active filter parameters; swapped wholesale on config reload, so every
/// batch sees a consistent snapshot.
struct Params {
    drop_patterns: Vec<String>,
    sensitive_keys: Vec<String>,
    max_message_bytes: usize,
    max_metadata_bytes: usize,
    rate_limit_rps: u32,
    burst_limit: u32,
}

impl Params {
    fn from_config(cfg: &FilterConfig) -> Self {
        Params {
            drop_patterns: cfg.drop_patterns.iter().map(|p| p.to_lowercase()).collect(),
            sensitive_keys: cfg
                .sensitive_keys
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            max_message_bytes: cfg.max_message_bytes,
            max_metadata_bytes: cfg.max_metadata_bytes,
            rate_limit_rps: cfg.rate_limit_rps,
            burst_limit: cfg.burst_limit,
        }
    }
}

pub struct Sanitizer {
    params: std::sync::RwLock<Arc<Params>>,
    pub counters: FilterCounters,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Sanitizer {
    pub fn new(cfg: &FilterConfig) -> Self {
        Sanitizer {
            params: std::sync::RwLock::new(Arc::new(Params::from_config(cfg))),
            counters: FilterCounters::default(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in new filter parameters; affects subsequent records only.
    /// Counters and rate-limit buckets survive the reload.
    pub fn reconfigure(&self, cfg: &FilterConfig) {
        let mut params = self.params.write().unwrap_or_else(|e| e.into_inner());
        *params = Arc::new(Params::from_config(cfg));
    }

    fn params(&self) -> Arc<Params> {
        self.params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run the full chain on one record.
    pub fn apply(&self, mut record: LogRecord, now: Instant) -> FilterOutcome {
        let params = self.params();

        // 1. Drop patterns.
        if !params.drop_patterns.is_empty() {
            let message = record.message.to_lowercase();
            if params.drop_patterns.iter().any(|p| message.contains(p)) {
                self.counters
                    .dropped_by_filter
                    .fetch_add(1, Ordering::Relaxed);
                return FilterOutcome::Drop(DropReason::Pattern);
            }
        }

        // 2. Field redaction (recursive into nested maps).
        let is_error = record.level >= Level::Error;
        let mut redacted = 0u64;
        for (key, value) in record.metadata.iter_mut() {
            walk_value(&params, key, value, is_error, &mut redacted);
        }
        if redacted > 0 {
            self.counters
                .redacted_fields
                .fetch_add(redacted, Ordering::Relaxed);
        }

        // 3. Size bounds.
        let mut truncated = false;
        if record.message.len() > params.max_message_bytes {
            record.message = truncate_string(&record.message, params.max_message_bytes);
            truncated = true;
        }
        if metadata_size(&record) > params.max_metadata_bytes {
            shrink_metadata(&mut record, params.max_metadata_bytes);
            truncated = true;
        }
        if truncated {
            record
                .metadata
                .insert("truncated".to_owned(), MetaValue::Bool(true));
            self.counters.truncated.fetch_add(1, Ordering::Relaxed);
        }

        // 4. Rate limiting (token bucket per source).
        if params.rate_limit_rps > 0 && params.burst_limit > 0 {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let bucket = buckets
                .entry(record.source.clone())
                .or_insert_with(|| TokenBucket {
                    tokens: f64::from(params.burst_limit),
                    last_refill: now,
                });
            if !bucket.try_take(
                now,
                f64::from(params.rate_limit_rps),
                f64::from(params.burst_limit),
            ) {
                self.counters
                    .dropped_rate_limited
                    .fetch_add(1, Ordering::Relaxed);
                return FilterOutcome::Drop(DropReason::RateLimited);
            }
        }

        FilterOutcome::Keep(Box::new(record))
    }

    /// Redact a free-form JSON value (outbound error details).
    pub fn sanitize_json(&self, value: serde_json::Value) -> serde_json::Value {
        let params = self.params();
        let mut meta = MetaValue::from(value);
        let mut redacted = 0u64;
        walk_value(&params, "", &mut meta, false, &mut redacted);
        serde_json::Value::from(meta)
    }
}

/// Redact sensitive keys and trim `stack` fields; recursive.
fn walk_value(params: &Params, key: &str, value: &mut MetaValue, is_error: bool, redacted: &mut u64) {
    let key_lower = key.to_lowercase();
    if params.sensitive_keys.iter().any(|s| key_lower.contains(s)) {
        *value = MetaValue::String(REDACTED.to_owned());
        *redacted += 1;
        return;
    }
    if is_error && key_lower == "stack" {
        if let MetaValue::String(stack) = value {
            if stack.chars().count() > STACK_TRIM_CHARS {
                let mut trimmed: String = stack.chars().take(STACK_TRIM_CHARS).collect();
                trimmed.push_str("...");
                *value = MetaValue::String(trimmed);
            }
            return;
        }
    }
    match value {
        MetaValue::Object(map) => {
            for (k, v) in map.iter_mut() {
                walk_value(params, k, v, is_error, redacted);
            }
        }
        MetaValue::Array(items) => {
            for item in items.iter_mut() {
                walk_value(params, key, item, is_error, redacted);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Size helpers
// ---------------------------------------------------------------------------

/// Cut `s` to at most `max_bytes` (char-safe) and append the marker.
fn truncate_string(s: &str, max_bytes: usize) -> String {
    let mut cut = max_bytes.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = s[..cut].to_owned();
    out.push_str(TRUNCATED_MARKER);
    out
}

fn metadata_size(record: &LogRecord) -> usize {
    serde_json::to_string(&record.metadata).map_or(0, |s| s.len())
}

/// Bring serialized metadata under `max_bytes`: first cut oversized string
/// values, then drop the largest remaining entries wholesale.
fn shrink_metadata(record: &mut LogRecord, max_bytes: usize) {
    for value in record.metadata.values_mut() {
        if let MetaValue::String(s) = value {
            if s.len() > STRING_VALUE_CAP {
                *value = MetaValue::String(truncate_string(s, STRING_VALUE_CAP));
            }
        }
    }
    while metadata_size(record) > max_bytes && !record.metadata.is_empty() {
        let largest = record
            .metadata
            .iter()
            .max_by_key(|(_, v)| serde_json::to_string(v).map_or(0, |s| s.len()))
            .map(|(k, _)| k.clone());
        match largest {
            Some(key) => {
                record
                    .metadata
                    .insert(key, MetaValue::String(TRUNCATED_MARKER.to_owned()));
                // Replacing may not shrink if the entry was already small;
                // fall back to removing it outright.
                if metadata_size(record) > max_bytes {
                    let largest = record
                        .metadata
                        .iter()
                        .max_by_key(|(_, v)| serde_json::to_string(v).map_or(0, |s| s.len()))
                        .map(|(k, _)| k.clone());
                    if let Some(key) = largest {
                        record.metadata.remove(&key);
                    }
                }
            }
            None => break,
        }
    }
}
