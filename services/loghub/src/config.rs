//! Service configuration loading.
//!
//! TOML is the sole config source; every field has a default, so an absent
//! file yields a fully usable config. A reload builds a fresh `Config` and
//! swaps the shared pointer atomically; filter parameters and query limits
//! pick up the new values on the next operation, while channel capacities
//! and batch sizes are fixed at startup.
//!
//! # Required fields
//! - `schema_version = 1` (only when a file is present)

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./loghub.toml";

pub fn default_enabled_collectors() -> Vec<String> {
    ["mcp_calls", "websocket", "ai_analysis", "http_requests"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub graceful_shutdown_timeout_ms: u64,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub filter: FilterSection,
    pub stream: StreamConfig,
    pub query: QuerySection,
    pub collectors: CollectorsConfig,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub dead_letter_path: PathBuf,
    pub max_size_mb: u64,
    pub retention_days: u32,
    pub retention_check_secs: u64,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub buffer: usize,
    pub enqueue_deadline_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FilterSection {
    pub rate_limit_rps: u32,
    pub burst_limit: u32,
    pub sensitive_keys: Vec<String>,
    pub drop_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_max_subscribers: usize,
    pub subscriber_buffer: usize,
    pub reconnect_grace_ms: u64,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct QuerySection {
    pub max_concurrent: usize,
    pub queue_wait_ms: u64,
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CollectorsConfig {
    pub auto_restart: bool,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub health_check_interval_ms: u64,
    /// Collectors started at boot; the rest stay registered but stopped
    /// until `collector.toggle` starts them.
    pub enabled: Vec<String>,
    pub websocket_log_messages: bool,
    pub http_ignore_prefixes: Vec<String>,
    pub http_slow_ms: u64,
    pub ai_slow_analysis_ms: u64,
    pub ai_slow_call_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: 1,
            host: "127.0.0.1".to_owned(),
            port: 9600,
            log_level: "info".to_owned(),
            graceful_shutdown_timeout_ms: 30_000,
            storage: StorageConfig {
                db_path: PathBuf::from("./logs/logs.db"),
                dead_letter_path: PathBuf::from("./logs/dead-letter.ndjson"),
                max_size_mb: 512,
                retention_days: 7,
                retention_check_secs: 60,
            },
            ingest: IngestConfig {
                buffer: 10_000,
                enqueue_deadline_ms: 100,
                batch_size: 500,
                flush_interval_ms: 50,
            },
            filter: FilterSection {
                rate_limit_rps: 0,
                burst_limit: 0,
                sensitive_keys: crate::filter::default_sensitive_keys(),
                drop_patterns: Vec::new(),
            },
            stream: StreamConfig {
                ws_max_subscribers: 256,
                subscriber_buffer: 1_024,
                reconnect_grace_ms: 30_000,
                auto_reconnect: true,
            },
            query: QuerySection {
                max_concurrent: 8,
                queue_wait_ms: 2_000,
                default_timeout_ms: 10_000,
            },
            collectors: CollectorsConfig {
                auto_restart: true,
                retry_delay_ms: 5_000,
                max_retries: 5,
                health_check_interval_ms: 30_000,
                enabled: default_enabled_collectors(),
                websocket_log_messages: false,
                http_ignore_prefixes: crate::collector::http::default_ignore_prefixes(),
                http_slow_ms: 1_000,
                ai_slow_analysis_ms: 30_000,
                ai_slow_call_ms: 5_000,
            },
        }
    }
}

impl Config {
    pub fn filter_config(&self) -> crate::filter::FilterConfig {
        crate::filter::FilterConfig {
            drop_patterns: self.filter.drop_patterns.clone(),
            sensitive_keys: self.filter.sensitive_keys.clone(),
            rate_limit_rps: self.filter.rate_limit_rps,
            burst_limit: self.filter.burst_limit,
            ..crate::filter::FilterConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    host: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    graceful_shutdown_timeout_ms: Option<u64>,
    storage: Option<RawStorage>,
    ingest: Option<RawIngest>,
    filter: Option<RawFilter>,
    stream: Option<RawStream>,
    query: Option<RawQuery>,
    collectors: Option<RawCollectors>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    db_path: Option<String>,
    dead_letter_path: Option<String>,
    max_size_mb: Option<u64>,
    retention_days: Option<u32>,
    retention_check_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawIngest {
    buffer: Option<usize>,
    enqueue_deadline_ms: Option<u64>,
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    rate_limit_rps: Option<u32>,
    burst_limit: Option<u32>,
    sensitive_keys: Option<Vec<String>>,
    drop_patterns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    ws_max_subscribers: Option<usize>,
    subscriber_buffer: Option<usize>,
    reconnect_grace_ms: Option<u64>,
    auto_reconnect: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    max_concurrent: Option<usize>,
    queue_wait_ms: Option<u64>,
    default_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCollectors {
    auto_restart: Option<bool>,
    retry_delay_ms: Option<u64>,
    max_retries: Option<u32>,
    health_check_interval_ms: Option<u64>,
    enabled: Option<Vec<String>>,
    websocket_log_messages: Option<bool>,
    http_ignore_prefixes: Option<Vec<String>>,
    http_slow_ms: Option<u64>,
    ai_slow_analysis_ms: Option<u64>,
    ai_slow_call_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `path`; a missing file yields the defaults.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let defaults = Config::default();

    let storage = match raw.storage {
        Some(s) => StorageConfig {
            db_path: s
                .db_path
                .map_or(defaults.storage.db_path.clone(), PathBuf::from),
            dead_letter_path: s
                .dead_letter_path
                .map_or(defaults.storage.dead_letter_path.clone(), PathBuf::from),
            max_size_mb: s.max_size_mb.unwrap_or(defaults.storage.max_size_mb),
            retention_days: s.retention_days.unwrap_or(defaults.storage.retention_days),
            retention_check_secs: s
                .retention_check_secs
                .unwrap_or(defaults.storage.retention_check_secs),
        },
        None => defaults.storage.clone(),
    };

    let ingest = match raw.ingest {
        Some(i) => IngestConfig {
            buffer: i.buffer.unwrap_or(defaults.ingest.buffer),
            enqueue_deadline_ms: i
                .enqueue_deadline_ms
                .unwrap_or(defaults.ingest.enqueue_deadline_ms),
            batch_size: i.batch_size.unwrap_or(defaults.ingest.batch_size),
            flush_interval_ms: i
                .flush_interval_ms
                .unwrap_or(defaults.ingest.flush_interval_ms),
        },
        None => defaults.ingest.clone(),
    };
    if ingest.buffer == 0 {
        return Err(ConfigError::InvalidValue(
            "ingest.buffer must be at least 1".to_owned(),
        ));
    }
    if ingest.batch_size == 0 || ingest.batch_size > 10_000 {
        return Err(ConfigError::InvalidValue(
            "ingest.batch_size must be in 1..=10000".to_owned(),
        ));
    }

    let filter = match raw.filter {
        Some(f) => FilterSection {
            rate_limit_rps: f.rate_limit_rps.unwrap_or(defaults.filter.rate_limit_rps),
            burst_limit: f.burst_limit.unwrap_or(defaults.filter.burst_limit),
            sensitive_keys: f
                .sensitive_keys
                .unwrap_or_else(|| defaults.filter.sensitive_keys.clone()),
            drop_patterns: f
                .drop_patterns
                .unwrap_or_else(|| defaults.filter.drop_patterns.clone()),
        },
        None => defaults.filter.clone(),
    };

    let stream = match raw.stream {
        Some(s) => StreamConfig {
            ws_max_subscribers: s
                .ws_max_subscribers
                .unwrap_or(defaults.stream.ws_max_subscribers),
            subscriber_buffer: s
                .subscriber_buffer
                .unwrap_or(defaults.stream.subscriber_buffer),
            reconnect_grace_ms: s
                .reconnect_grace_ms
                .unwrap_or(defaults.stream.reconnect_grace_ms),
            auto_reconnect: s.auto_reconnect.unwrap_or(defaults.stream.auto_reconnect),
        },
        None => defaults.stream.clone(),
    };

    let query = match raw.query {
        Some(q) => QuerySection {
            max_concurrent: q.max_concurrent.unwrap_or(defaults.query.max_concurrent),
            queue_wait_ms: q.queue_wait_ms.unwrap_or(defaults.query.queue_wait_ms),
            default_timeout_ms: q
                .default_timeout_ms
                .unwrap_or(defaults.query.default_timeout_ms),
        },
        None => defaults.query.clone(),
    };
    if query.max_concurrent == 0 {
        return Err(ConfigError::InvalidValue(
            "query.max_concurrent must be at least 1".to_owned(),
        ));
    }

    let collectors = match raw.collectors {
        Some(c) => CollectorsConfig {
            auto_restart: c.auto_restart.unwrap_or(defaults.collectors.auto_restart),
            retry_delay_ms: c
                .retry_delay_ms
                .unwrap_or(defaults.collectors.retry_delay_ms),
            max_retries: c.max_retries.unwrap_or(defaults.collectors.max_retries),
            health_check_interval_ms: c
                .health_check_interval_ms
                .unwrap_or(defaults.collectors.health_check_interval_ms),
            enabled: c
                .enabled
                .unwrap_or_else(|| defaults.collectors.enabled.clone()),
            websocket_log_messages: c
                .websocket_log_messages
                .unwrap_or(defaults.collectors.websocket_log_messages),
            http_ignore_prefixes: c
                .http_ignore_prefixes
                .unwrap_or_else(|| defaults.collectors.http_ignore_prefixes.clone()),
            http_slow_ms: c.http_slow_ms.unwrap_or(defaults.collectors.http_slow_ms),
            ai_slow_analysis_ms: c
                .ai_slow_analysis_ms
                .unwrap_or(defaults.collectors.ai_slow_analysis_ms),
            ai_slow_call_ms: c
                .ai_slow_call_ms
                .unwrap_or(defaults.collectors.ai_slow_call_ms),
        },
        None => defaults.collectors.clone(),
    };

    Ok(Config {
        schema_version,
        host: raw.host.unwrap_or(defaults.host),
        port: raw.port.unwrap_or(defaults.port),
        log_level: raw.log_level.unwrap_or(defaults.log_level),
        graceful_shutdown_timeout_ms: raw
            .graceful_shutdown_timeout_ms
            .unwrap_or(defaults.graceful_shutdown_timeout_ms),
        storage,
        ingest,
        filter,
        stream,
        query,
        collectors,
    })
}

// ---------------------------------------------------------------------------
// Shared (reloadable) config cell
// ---------------------------------------------------------------------------

/// Copy-on-write config shared across tasks. `load` hands out the current
/// snapshot; `store` swaps the pointer atomically.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self, config: Config) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_rejected_but_missing_file_defaults() {
        assert!(matches!(
            load_config_from_str(""),
            Err(ConfigError::MissingField(_))
        ));
        let config =
            load_config_from_path(Path::new("/nonexistent/loghub.toml")).expect("defaults");
        assert_eq!(config.port, 9600);
        assert_eq!(config.ingest.batch_size, 500);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config = load_config_from_str(
            r#"
schema_version = 1
port = 7000

[filter]
drop_patterns = ["heartbeat"]

[storage]
retention_days = 30
"#,
        )
        .expect("parse");
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.filter.drop_patterns, vec!["heartbeat".to_owned()]);
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.storage.max_size_mb, 512);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            load_config_from_str("schema_version = 2"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            load_config_from_str("schema_version = 1\n[ingest]\nbatch_size = 0"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            load_config_from_str("schema_version = 1\n[query]\nmax_concurrent = 0"),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn shared_config_swaps_atomically() {
        let shared = SharedConfig::new(Config::default());
        let before = shared.load();
        let mut next = Config::default();
        next.port = 1234;
        shared.store(next);
        assert_eq!(before.port, 9600, "old snapshot is unchanged");
        assert_eq!(shared.load().port, 1234);
    }
}
