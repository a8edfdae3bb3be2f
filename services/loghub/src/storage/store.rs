//! SQLite-backed log store.
//!
//! # Schema
//! - `logs`: one row per record; `id` is the AUTOINCREMENT rowid, so ids are
//!   unique, strictly increasing with ingest order, and never reused.
//! - `logs_fts`: external-content FTS5 index over `message`, synchronized by
//!   triggers (retention deletes prune the index with the rows).
//! - `meta`: schema version row, checked on open; a mismatch refuses to open.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON, auto_vacuum=INCREMENTAL. `PRAGMA integrity_check` runs at
//! open; WAL recovery truncates an incomplete final transaction by itself, so
//! a failing integrity check means corruption beyond auto-repair.
//!
//! # Text queries
//! FTS5 (phrase-prefix, case-insensitive) serves token/phrase/prefix needles.
//! Needles FTS cannot express (mid-token substrings, punctuation) and the
//! explicit case-sensitive mode fall back to an `instr` scan over the
//! attribute-filtered window. `/…/` regex needles bypass FTS entirely and
//! scan a capped window; `approximate` is signalled when the cap was hit.

use chrono::{DateTime, Utc};
use loghub_protocol::{
    Highlight, Level, LogRecord, Metadata, Order, QueryResult, SearchResult, StatsBucket,
    StatsResult,
};
use rusqlite::{params, types::Value as SqlValue, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Current on-disk schema version; a stored mismatch refuses to start.
pub const SCHEMA_VERSION: i64 = 1;

/// Rows a regex query will scan before giving up on exactness.
const REGEX_SCAN_CAP: usize = 10_000;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("schema version mismatch: found {found}, want {want}")]
    SchemaVersion { found: i64, want: i64 },
    #[error("invalid regex: {0}")]
    Regex(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// True when the underlying SQLite statement was interrupted via an
    /// [`rusqlite::InterruptHandle`] (deadline or caller cancellation).
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::OperationInterrupted
        ) || matches!(self, StorageError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Resolved query shapes
// ---------------------------------------------------------------------------

/// Text-match strategy, resolved by the API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextQuery {
    /// FTS5 phrase-prefix match, case-insensitive.
    Fts(String),
    /// `instr` substring scan.
    Substring { needle: String, case_sensitive: bool },
    /// Regex scan over a capped window.
    Regex(String),
}

impl TextQuery {
    /// Pick a strategy for a raw needle. `/…/` literals and `regex=true`
    /// force regex; explicit case sensitivity forces the scan path; FTS
    /// handles the rest when the needle is made of plain word tokens.
    pub fn resolve(raw: &str, case_sensitive: bool, regex: bool) -> TextQuery {
        if regex {
            return TextQuery::Regex(raw.to_owned());
        }
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            return TextQuery::Regex(raw[1..raw.len() - 1].to_owned());
        }
        if case_sensitive {
            return TextQuery::Substring {
                needle: raw.to_owned(),
                case_sensitive: true,
            };
        }
        let token_friendly = !raw.trim().is_empty()
            && raw.chars().all(|c| c.is_alphanumeric() || c.is_whitespace());
        if token_friendly {
            TextQuery::Fts(raw.trim().to_owned())
        } else {
            TextQuery::Substring {
                needle: raw.to_owned(),
                case_sensitive: false,
            }
        }
    }
}

/// A fully validated, time-resolved query (see the API layer for the
/// validation rules; storage trusts these fields).
#[derive(Debug, Clone, Default)]
pub struct ResolvedQuery {
    pub sources: Vec<String>,
    pub levels: Vec<Level>,
    pub min_level: Option<Level>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    /// Only records with id strictly greater than this (replay from a
    /// client-supplied `last_id`).
    pub min_id: Option<u64>,
    pub trace_id: Option<String>,
    pub tags: Vec<String>,
    pub text: Option<TextQuery>,
    pub limit: u32,
    pub offset: u64,
    pub order: Order,
}

/// A fully validated, time-resolved search request.
#[derive(Debug, Clone)]
pub struct ResolvedSearch {
    pub text: TextQuery,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    /// Extra metadata fields searched alongside `message` (scan path only).
    pub fields: Vec<String>,
    pub highlight: bool,
    /// Records of surrounding context per match (by adjacent id).
    pub context: u32,
    pub limit: u32,
}

// ---------------------------------------------------------------------------
// LogStore (write handle)
// ---------------------------------------------------------------------------

/// The single-writer store handle.
pub struct LogStore {
    conn: Connection,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore").finish_non_exhaustive()
    }
}

impl LogStore {
    /// Open (or create) the store at `path`.
    ///
    /// Applies pragmas, runs `PRAGMA integrity_check`, creates the schema on
    /// first open, and verifies the stored schema version otherwise.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA auto_vacuum=INCREMENTAL;
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        run_integrity_check(&conn)?;
        check_or_init_schema(&conn)?;
        Ok(LogStore { conn })
    }

    /// Append a batch of records in a single transaction.
    ///
    /// Assigns ids in accepted order (strictly increasing), writes them back
    /// into `records`, and returns them. On failure nothing is persisted and
    /// ids are left untouched; the caller may retry the whole batch.
    pub fn append_batch(&mut self, records: &mut [LogRecord]) -> Result<Vec<u64>, StorageError> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO logs (ts_ms, level, source, message, metadata, tags, trace_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records.iter() {
                let metadata = if record.metadata.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&record.metadata).map_err(|e| {
                        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
                    })?)
                };
                let tags = if record.tags.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&record.tags).map_err(|e| {
                        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
                    })?)
                };
                stmt.execute(params![
                    record.timestamp.timestamp_millis(),
                    record.level.rank(),
                    record.source,
                    record.message,
                    metadata,
                    tags,
                    record.trace_id,
                ])?;
                ids.push(tx.last_insert_rowid() as u64);
            }
        }
        tx.commit()?;
        for (record, id) in records.iter_mut().zip(&ids) {
            record.id = *id;
        }
        Ok(ids)
    }

    pub fn total_logs(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Bytes of live data (pages in use minus freelist).
    pub fn live_size_bytes(&self) -> Result<u64, StorageError> {
        live_size_bytes(&self.conn)
    }

    /// Delete up to `max_rows` records older than `cutoff_ms`.
    ///
    /// Returns the number of rows deleted; callers loop until it returns 0,
    /// dropping the store lock between rounds so the writer interleaves.
    pub fn delete_older_than(&mut self, cutoff_ms: i64, max_rows: u32) -> Result<u64, StorageError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM logs WHERE id IN (
                 SELECT id FROM logs WHERE ts_ms < ?1 ORDER BY id ASC LIMIT ?2
             )",
            params![cutoff_ms, max_rows],
        )?;
        tx.commit()?;
        Ok(deleted as u64)
    }

    /// Delete the `max_rows` oldest records (size-based retention).
    pub fn delete_oldest(&mut self, max_rows: u32) -> Result<u64, StorageError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM logs WHERE id IN (
                 SELECT id FROM logs ORDER BY id ASC LIMIT ?1
             )",
            params![max_rows],
        )?;
        tx.commit()?;
        Ok(deleted as u64)
    }

    /// Return up to `pages` freelist pages to the OS after bulk deletes.
    pub fn incremental_vacuum(&self, pages: u32) -> Result<(), StorageError> {
        self.conn
            .execute_batch(&format!("PRAGMA incremental_vacuum({pages});"))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// ReadStore (read-only handle)
// ---------------------------------------------------------------------------

/// A read-only connection to the store file.
///
/// Open one per concurrent query; WAL mode lets readers proceed while the
/// single writer commits.
pub struct ReadStore {
    conn: Connection,
}

impl ReadStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA query_only=ON; PRAGMA busy_timeout=5000;")?;
        Ok(ReadStore { conn })
    }

    /// Handle for interrupting a statement running on this connection from
    /// another thread (cancellation / deadline enforcement).
    pub fn interrupt_handle(&self) -> rusqlite::InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    pub fn total_logs(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn live_size_bytes(&self) -> Result<u64, StorageError> {
        live_size_bytes(&self.conn)
    }

    /// Point lookup by id.
    pub fn get(&self, id: u64) -> Result<Option<LogRecord>, StorageError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM logs WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id as i64], map_record)?;
        Ok(rows.next().transpose()?)
    }

    /// Filtered, paged query (§ query semantics in the module docs).
    pub fn query(&self, q: &ResolvedQuery) -> Result<QueryResult, StorageError> {
        if let Some(TextQuery::Regex(pattern)) = &q.text {
            return self.regex_query(q, pattern);
        }

        let mut params_vec: Vec<SqlValue> = Vec::new();
        let where_clause = build_where(q, &mut params_vec);
        let order = order_sql(q.order);

        let sql = format!(
            "SELECT {COLUMNS} FROM logs {where_clause} ORDER BY ts_ms {order}, id {order} \
             LIMIT ? OFFSET ?"
        );
        let mut page_params = params_vec.clone();
        page_params.push(SqlValue::from(q.limit as i64));
        page_params.push(SqlValue::from(q.offset as i64));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let logs = stmt
            .query_map(rusqlite::params_from_iter(page_params), map_record)?
            .collect::<Result<Vec<_>, _>>()?;

        let count_sql = format!("SELECT COUNT(*) FROM logs {where_clause}");
        let mut count_stmt = self.conn.prepare_cached(&count_sql)?;
        let total: i64 =
            count_stmt.query_row(rusqlite::params_from_iter(params_vec), |row| row.get(0))?;

        Ok(QueryResult {
            logs,
            total_matches: total as u64,
            approximate: false,
        })
    }

    /// Regex queries scan the attribute-filtered window in requested order,
    /// capped at [`REGEX_SCAN_CAP`] rows; `approximate` is set when the cap
    /// was reached before the window was exhausted.
    fn regex_query(&self, q: &ResolvedQuery, pattern: &str) -> Result<QueryResult, StorageError> {
        let re = regex::Regex::new(pattern).map_err(|e| StorageError::Regex(e.to_string()))?;

        let mut params_vec: Vec<SqlValue> = Vec::new();
        let mut stripped = q.clone();
        stripped.text = None;
        let where_clause = build_where(&stripped, &mut params_vec);
        let order = order_sql(q.order);

        let sql = format!(
            "SELECT {COLUMNS} FROM logs {where_clause} ORDER BY ts_ms {order}, id {order} LIMIT ?"
        );
        params_vec.push(SqlValue::from((REGEX_SCAN_CAP + 1) as i64));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut scanned = 0usize;
        let mut matched = 0u64;
        let mut logs = Vec::new();
        let skip = q.offset;
        let mut rows = stmt.query(rusqlite::params_from_iter(params_vec))?;
        let mut truncated = false;
        while let Some(row) = rows.next()? {
            scanned += 1;
            if scanned > REGEX_SCAN_CAP {
                truncated = true;
                break;
            }
            let record = map_record(row)?;
            if re.is_match(&record.message) {
                matched += 1;
                if matched > skip && logs.len() < q.limit as usize {
                    logs.push(record);
                }
            }
        }

        Ok(QueryResult {
            logs,
            total_matches: matched,
            approximate: truncated,
        })
    }

    /// Full-text search with optional highlights and context records.
    pub fn search(&self, s: &ResolvedSearch) -> Result<SearchResult, StorageError> {
        let started = Instant::now();

        let q = ResolvedQuery {
            since_ms: s.since_ms,
            until_ms: s.until_ms,
            text: Some(s.text.clone()),
            limit: s.limit,
            order: Order::Desc,
            ..ResolvedQuery::default()
        };

        let mut result = if s.fields.is_empty() {
            self.query(&q)?
        } else {
            self.search_with_fields(&q, &s.fields)?
        };

        let highlights = if s.highlight {
            result
                .logs
                .iter()
                .filter_map(|record| {
                    highlight_message(&record.message, &s.text).map(|highlighted_text| Highlight {
                        record_id: record.id,
                        highlighted_text,
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        if s.context > 0 {
            self.attach_context(&mut result.logs, s.context)?;
        }

        Ok(SearchResult {
            logs: result.logs,
            highlights,
            total_matches: result.total_matches,
            search_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Search over `message` plus selected metadata fields (scan path; the
    /// FTS index only covers `message`).
    fn search_with_fields(
        &self,
        q: &ResolvedQuery,
        fields: &[String],
    ) -> Result<QueryResult, StorageError> {
        let needle = match q.text.as_ref() {
            Some(TextQuery::Fts(n)) => n.clone(),
            Some(TextQuery::Substring { needle, .. }) => needle.clone(),
            _ => String::new(),
        };

        let mut params_vec: Vec<SqlValue> = Vec::new();
        let mut stripped = q.clone();
        stripped.text = None;
        let base_where = build_where(&stripped, &mut params_vec);

        let mut text_clauses = vec!["instr(lower(message), lower(?)) > 0".to_owned()];
        params_vec.push(SqlValue::from(needle.clone()));
        for field in fields {
            text_clauses
                .push("instr(lower(coalesce(json_extract(metadata, ?), '')), lower(?)) > 0".to_owned());
            params_vec.push(SqlValue::from(format!("$.{field}")));
            params_vec.push(SqlValue::from(needle.clone()));
        }
        let text_clause = text_clauses.join(" OR ");
        let where_clause = if base_where.is_empty() {
            format!("WHERE ({text_clause})")
        } else {
            format!("{base_where} AND ({text_clause})")
        };

        let sql = format!(
            "SELECT {COLUMNS} FROM logs {where_clause} ORDER BY ts_ms DESC, id DESC LIMIT ?"
        );
        let mut page_params = params_vec.clone();
        page_params.push(SqlValue::from(q.limit as i64));
        let mut stmt = self.conn.prepare(&sql)?;
        let logs = stmt
            .query_map(rusqlite::params_from_iter(page_params), map_record)?
            .collect::<Result<Vec<_>, _>>()?;

        let count_sql = format!("SELECT COUNT(*) FROM logs {where_clause}");
        let total: i64 = self
            .conn
            .prepare(&count_sql)?
            .query_row(rusqlite::params_from_iter(params_vec), |row| row.get(0))?;

        Ok(QueryResult {
            logs,
            total_matches: total as u64,
            approximate: false,
        })
    }

    /// Pull up to `context` records on either side of each match (by id) and
    /// splice them in, deduplicated, preserving descending order.
    fn attach_context(
        &self,
        logs: &mut Vec<LogRecord>,
        context: u32,
    ) -> Result<(), StorageError> {
        let mut seen: std::collections::BTreeSet<u64> = logs.iter().map(|r| r.id).collect();
        let mut extra = Vec::new();
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM logs WHERE id >= ?1 AND id <= ?2"
        ))?;
        for id in logs.iter().map(|r| r.id).collect::<Vec<_>>() {
            let lo = id.saturating_sub(context as u64) as i64;
            let hi = (id + context as u64) as i64;
            let neighbours = stmt
                .query_map(params![lo, hi], map_record)?
                .collect::<Result<Vec<_>, _>>()?;
            for n in neighbours {
                if seen.insert(n.id) {
                    extra.push(n);
                }
            }
        }
        logs.extend(extra);
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(())
    }

    /// Aggregate stats over `[since_ms, until_ms)` with `bucket_ms` buckets.
    pub fn stats(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_ms: i64,
    ) -> Result<StatsResult, StorageError> {
        let mut by_level: BTreeMap<String, u64> = BTreeMap::new();
        let mut total: u64 = 0;
        let mut errors: u64 = 0;
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT level, COUNT(*) FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2 GROUP BY level",
            )?;
            let mut rows = stmt.query(params![since_ms, until_ms])?;
            while let Some(row) = rows.next()? {
                let rank: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                let level = Level::from_rank(rank as u8).unwrap_or(Level::Info);
                by_level.insert(level.as_str().to_owned(), count as u64);
                total += count as u64;
                if level >= Level::Error {
                    errors += count as u64;
                }
            }
        }

        let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT source, COUNT(*) FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2 GROUP BY source",
            )?;
            let mut rows = stmt.query(params![since_ms, until_ms])?;
            while let Some(row) = rows.next()? {
                let source: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                by_source.insert(source, count as u64);
            }
        }

        let mut buckets: Vec<StatsBucket> = Vec::new();
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT (ts_ms / ?3) * ?3 AS bucket, level, COUNT(*)
                 FROM logs WHERE ts_ms >= ?1 AND ts_ms < ?2
                 GROUP BY bucket, level ORDER BY bucket ASC",
            )?;
            let mut rows = stmt.query(params![since_ms, until_ms, bucket_ms])?;
            while let Some(row) = rows.next()? {
                let bucket_start: i64 = row.get(0)?;
                let rank: i64 = row.get(1)?;
                let count: i64 = row.get(2)?;
                let ts = DateTime::<Utc>::from_timestamp_millis(bucket_start)
                    .unwrap_or_else(Utc::now);
                let level = Level::from_rank(rank as u8).unwrap_or(Level::Info);
                match buckets.last_mut() {
                    Some(last) if last.ts == ts => {
                        last.count += count as u64;
                        *last.by_level.entry(level.as_str().to_owned()).or_insert(0) +=
                            count as u64;
                    }
                    _ => {
                        let mut per_level = BTreeMap::new();
                        per_level.insert(level.as_str().to_owned(), count as u64);
                        buckets.push(StatsBucket {
                            ts,
                            count: count as u64,
                            by_level: per_level,
                        });
                    }
                }
            }
        }

        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };

        Ok(StatsResult {
            total_logs: total,
            by_level,
            by_source,
            time_distribution: buckets,
            error_rate,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Shared SQL helpers
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, ts_ms, level, source, message, metadata, tags, trace_id";

fn order_sql(order: Order) -> &'static str {
    match order {
        Order::Asc => "ASC",
        Order::Desc => "DESC",
    }
}

/// Build the WHERE clause for a resolved query, pushing parameters in the
/// same order the clause references them. Regex text must be stripped by the
/// caller; everything else is index- or json_each-backed.
fn build_where(q: &ResolvedQuery, params_vec: &mut Vec<SqlValue>) -> String {
    let mut clauses: Vec<String> = Vec::new();

    if !q.sources.is_empty() {
        let marks = vec!["?"; q.sources.len()].join(", ");
        clauses.push(format!("source IN ({marks})"));
        for s in &q.sources {
            params_vec.push(SqlValue::from(s.clone()));
        }
    }
    if !q.levels.is_empty() {
        let marks = vec!["?"; q.levels.len()].join(", ");
        clauses.push(format!("level IN ({marks})"));
        for l in &q.levels {
            params_vec.push(SqlValue::from(l.rank() as i64));
        }
    }
    if let Some(min) = q.min_level {
        clauses.push("level >= ?".to_owned());
        params_vec.push(SqlValue::from(min.rank() as i64));
    }
    if let Some(since) = q.since_ms {
        clauses.push("ts_ms >= ?".to_owned());
        params_vec.push(SqlValue::from(since));
    }
    if let Some(until) = q.until_ms {
        clauses.push("ts_ms < ?".to_owned());
        params_vec.push(SqlValue::from(until));
    }
    if let Some(min_id) = q.min_id {
        clauses.push("id > ?".to_owned());
        params_vec.push(SqlValue::from(min_id as i64));
    }
    if let Some(trace) = &q.trace_id {
        clauses.push("trace_id = ?".to_owned());
        params_vec.push(SqlValue::from(trace.clone()));
    }
    for tag in &q.tags {
        clauses.push(
            "EXISTS (SELECT 1 FROM json_each(coalesce(tags, '[]')) WHERE json_each.value = ?)"
                .to_owned(),
        );
        params_vec.push(SqlValue::from(tag.clone()));
    }
    match &q.text {
        Some(TextQuery::Fts(needle)) => {
            clauses.push("id IN (SELECT rowid FROM logs_fts WHERE logs_fts MATCH ?)".to_owned());
            params_vec.push(SqlValue::from(fts_phrase_prefix(needle)));
        }
        Some(TextQuery::Substring {
            needle,
            case_sensitive,
        }) => {
            if *case_sensitive {
                clauses.push("instr(message, ?) > 0".to_owned());
            } else {
                clauses.push("instr(lower(message), lower(?)) > 0".to_owned());
            }
            params_vec.push(SqlValue::from(needle.clone()));
        }
        Some(TextQuery::Regex(_)) | None => {}
    }

    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// Quote a needle as an FTS5 phrase-prefix query: `"payment tim"*` matches
/// "payment timed out". Embedded quotes are doubled per FTS5 escaping.
fn fts_phrase_prefix(needle: &str) -> String {
    format!("\"{}\" *", needle.replace('"', "\"\""))
}

fn map_record(row: &rusqlite::Row<'_>) -> Result<LogRecord, rusqlite::Error> {
    let ts_ms: i64 = row.get(1)?;
    let rank: i64 = row.get(2)?;
    let metadata: Option<String> = row.get(5)?;
    let tags: Option<String> = row.get(6)?;
    Ok(LogRecord {
        id: row.get::<_, i64>(0)? as u64,
        timestamp: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
        level: Level::from_rank(rank as u8).unwrap_or(Level::Info),
        source: row.get(3)?,
        message: row.get(4)?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str::<Metadata>)
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .unwrap_or_default(),
        tags: tags
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .unwrap_or_default(),
        trace_id: row.get(7)?,
    })
}

fn run_integrity_check(conn: &Connection) -> Result<(), StorageError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StorageError::IntegrityCheckFailed(result));
    }
    Ok(())
}

/// Verify the stored schema version, creating the schema on first open.
fn check_or_init_schema(conn: &Connection) -> Result<(), StorageError> {
    let has_meta: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
        [],
        |row| row.get(0),
    )?;
    if has_meta == 0 {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        return Ok(());
    }
    let found: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    let found: i64 = found.parse().unwrap_or(-1);
    if found != SCHEMA_VERSION {
        return Err(StorageError::SchemaVersion {
            found,
            want: SCHEMA_VERSION,
        });
    }
    Ok(())
}

fn live_size_bytes(conn: &Connection) -> Result<u64, StorageError> {
    let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
    let freelist: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
    Ok(((page_count - freelist).max(0) * page_size) as u64)
}

// ---------------------------------------------------------------------------
// Highlighting
// ---------------------------------------------------------------------------

/// Build a highlighted copy of `message` with match spans wrapped in
/// `<mark>` tags, or `None` when the needle does not occur. All offsets are
/// char-boundary safe.
pub fn highlight_message(message: &str, text: &TextQuery) -> Option<String> {
    let spans = match text {
        TextQuery::Regex(pattern) => {
            let re = regex::Regex::new(pattern).ok()?;
            re.find_iter(message)
                .map(|m| (m.start(), m.end()))
                .collect::<Vec<_>>()
        }
        TextQuery::Substring {
            needle,
            case_sensitive: true,
        } => message
            .match_indices(needle.as_str())
            .map(|(start, matched)| (start, start + matched.len()))
            .collect(),
        TextQuery::Substring { needle, .. } | TextQuery::Fts(needle) => {
            case_insensitive_spans(message, needle)
        }
    };
    if spans.is_empty() {
        return None;
    }
    Some(wrap_spans(message, &spans))
}

/// Case-insensitive occurrence spans, found on a case-folded copy and mapped
/// back to original byte offsets.
fn case_insensitive_spans(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    let needle_folded: String = needle.to_lowercase();
    if needle_folded.is_empty() {
        return Vec::new();
    }
    // Fold the haystack, recording the originating byte offset of every
    // folded byte (folding can change byte lengths, e.g. 'İ').
    let mut folded = String::new();
    let mut map: Vec<usize> = Vec::new();
    for (offset, ch) in haystack.char_indices() {
        for lc in ch.to_lowercase() {
            let before = folded.len();
            folded.push(lc);
            for _ in before..folded.len() {
                map.push(offset);
            }
        }
    }
    map.push(haystack.len());

    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(pos) = folded[from..].find(&needle_folded) {
        let start = from + pos;
        let end = start + needle_folded.len();
        let orig_start = map[start];
        let mut orig_end = map[end.min(map.len() - 1)];
        if orig_end <= orig_start {
            // Match ended mid-fold-expansion; extend to the char boundary.
            orig_end = haystack[orig_start..]
                .char_indices()
                .nth(1)
                .map_or(haystack.len(), |(i, _)| orig_start + i);
        }
        spans.push((orig_start, orig_end));
        from = end;
    }
    spans
}

/// Wrap `spans` (sorted, byte offsets) in `<mark>` tags, merging overlaps.
fn wrap_spans(message: &str, spans: &[(usize, usize)]) -> String {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for &(start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    let mut out = String::with_capacity(message.len() + merged.len() * 13);
    let mut cursor = 0;
    for (start, end) in merged {
        out.push_str(&message[cursor..start]);
        out.push_str("<mark>");
        out.push_str(&message[start..end]);
        out.push_str("</mark>");
        cursor = end;
    }
    out.push_str(&message[cursor..]);
    out
}
