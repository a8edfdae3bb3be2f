use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Severity level
// ---------------------------------------------------------------------------

/// Log severity, totally ordered from `Debug` (lowest) to `Fatal` (highest).
///
/// Wire representation is the uppercase name (`"DEBUG"` .. `"FATAL"`).
/// Storage uses the integer rank so threshold filters stay index-friendly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
    ];

    /// Integer severity rank (0 = DEBUG .. 4 = FATAL).
    pub fn rank(self) -> u8 {
        match self {
            Level::Debug => 0,
            Level::Info => 1,
            Level::Warn => 2,
            Level::Error => 3,
            Level::Fatal => 4,
        }
    }

    /// Inverse of [`Level::rank`]; `None` for out-of-range values.
    pub fn from_rank(rank: u8) -> Option<Level> {
        match rank {
            0 => Some(Level::Debug),
            1 => Some(Level::Info),
            2 => Some(Level::Warn),
            3 => Some(Level::Error),
            4 => Some(Level::Fatal),
            _ => None,
        }
    }

    /// Uppercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown log level '{0}'")]
pub struct LevelParseError(pub String);

impl FromStr for Level {
    type Err = LevelParseError;

    /// Case-insensitive parse of the wire name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            "FATAL" => Ok(Level::Fatal),
            _ => Err(LevelParseError(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata tree
// ---------------------------------------------------------------------------

/// Free-form structured attribute value.
///
/// A tagged variant tree with a canonical JSON codec: it serializes as the
/// plain JSON value, never as an enum wrapper.  `BTreeMap` keeps object key
/// order deterministic so persisted metadata round-trips byte-identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<MetaValue>),
    Object(BTreeMap<String, MetaValue>),
}

/// The metadata attribute bag attached to every record.
pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64, everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for MetaValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => MetaValue::Null,
            serde_json::Value::Bool(b) => MetaValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetaValue::Int(i)
                } else {
                    MetaValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => MetaValue::String(s),
            serde_json::Value::Array(a) => {
                MetaValue::Array(a.into_iter().map(MetaValue::from).collect())
            }
            serde_json::Value::Object(o) => MetaValue::Object(
                o.into_iter().map(|(k, v)| (k, MetaValue::from(v))).collect(),
            ),
        }
    }
}

impl From<MetaValue> for serde_json::Value {
    fn from(v: MetaValue) -> Self {
        match v {
            MetaValue::Null => serde_json::Value::Null,
            MetaValue::Bool(b) => serde_json::Value::Bool(b),
            MetaValue::Int(i) => serde_json::Value::from(i),
            MetaValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MetaValue::String(s) => serde_json::Value::String(s),
            MetaValue::Array(a) => {
                serde_json::Value::Array(a.into_iter().map(serde_json::Value::from).collect())
            }
            MetaValue::Object(o) => serde_json::Value::Object(
                o.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::String(s)
    }
}

// ---------------------------------------------------------------------------
// Timestamp codec
// ---------------------------------------------------------------------------

/// RFC3339 timestamps with exactly millisecond precision on the wire.
pub mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// `Option` variant of [`rfc3339_millis`].
pub mod rfc3339_millis_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_some(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// A stored log record: the atomic unit of the service.
///
/// `id` is assigned by storage on ingest, unique and strictly increasing
/// per storage instance.  Stored records are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: u64,
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LogRecord {
    /// Truncate the timestamp to millisecond precision (the storage and
    /// wire resolution), so a persisted record round-trips exactly.
    pub fn truncated_to_millis(mut self) -> Self {
        let millis = self.timestamp.timestamp_millis();
        if let Some(dt) = DateTime::<Utc>::from_timestamp_millis(millis) {
            self.timestamp = dt;
        }
        self
    }

    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

// ---------------------------------------------------------------------------
// RecordDraft
// ---------------------------------------------------------------------------

/// What writers submit: a record without an id, with an optional timestamp.
///
/// Unknown top-level fields are rejected; unknown metadata keys pass
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordDraft {
    #[serde(
        default,
        with = "rfc3339_millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Level,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl RecordDraft {
    /// Minimal draft with level/source/message; everything else empty.
    pub fn new(level: Level, source: impl Into<String>, message: impl Into<String>) -> Self {
        RecordDraft {
            timestamp: None,
            level,
            source: source.into(),
            message: message.into(),
            metadata: Metadata::new(),
            tags: Vec::new(),
            trace_id: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_and_rank_round_trip() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Error < Level::Fatal);
        for level in Level::ALL {
            assert_eq!(Level::from_rank(level.rank()), Some(level));
            assert_eq!(level.as_str().parse::<Level>(), Ok(level));
        }
        assert_eq!("warn".parse::<Level>(), Ok(Level::Warn));
        assert!("TRACE".parse::<Level>().is_err());
    }

    #[test]
    fn meta_value_serializes_as_plain_json() {
        let mut obj = BTreeMap::new();
        obj.insert("nested".to_owned(), MetaValue::Int(7));
        let value = MetaValue::Array(vec![
            MetaValue::Null,
            MetaValue::Bool(true),
            MetaValue::Float(1.5),
            MetaValue::String("x".to_owned()),
            MetaValue::Object(obj),
        ]);
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, r#"[null,true,1.5,"x",{"nested":7}]"#);
        let back: MetaValue = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, value);
    }

    #[test]
    fn draft_rejects_unknown_top_level_fields_but_keeps_unknown_metadata() {
        let bad = r#"{"level":"INFO","source":"s","message":"m","bogus":1}"#;
        assert!(serde_json::from_str::<RecordDraft>(bad).is_err());

        let ok = r#"{"level":"INFO","source":"s","message":"m","metadata":{"anything":{"goes":[1]}}}"#;
        let draft: RecordDraft = serde_json::from_str(ok).expect("parse");
        assert!(draft.metadata.contains_key("anything"));
    }

    #[test]
    fn timestamps_round_trip_as_rfc3339_millis() {
        let record = LogRecord {
            id: 42,
            timestamp: DateTime::parse_from_rfc3339("2026-03-01T12:00:00.123Z")
                .expect("parse")
                .with_timezone(&Utc),
            level: Level::Info,
            source: "http_requests".to_owned(),
            message: "hello".to_owned(),
            metadata: Metadata::new(),
            tags: Vec::new(),
            trace_id: None,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["timestamp"], "2026-03-01T12:00:00.123Z");
        let back: LogRecord = serde_json::from_value(json).expect("parse");
        assert_eq!(back, record);
    }
}
