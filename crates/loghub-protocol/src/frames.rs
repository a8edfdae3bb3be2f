use crate::query::TimeExpr;
use crate::record::{Level, LogRecord};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Subscription filter
// ---------------------------------------------------------------------------

/// Per-subscriber record filter for the live stream.
///
/// A subset of the query filter that can be evaluated against a single
/// record without touching storage.  `text` is a case-insensitive
/// substring match on `message`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFilter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<Level>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl StreamFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if !self.sources.is_empty() && !self.sources.iter().any(|s| *s == record.source) {
            return false;
        }
        if !self.levels.is_empty() && !self.levels.contains(&record.level) {
            return false;
        }
        if let Some(min) = self.min_level {
            if record.level < min {
                return false;
            }
        }
        if !self.tags.iter().all(|t| record.tags.iter().any(|r| r == t)) {
            return false;
        }
        if let Some(trace) = &self.trace_id {
            if record.trace_id.as_deref() != Some(trace.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !record.message.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Client -> server frames
// ---------------------------------------------------------------------------

/// Replay start point: a time expression or the last record id the client
/// already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Since {
    LastId(u64),
    Time(TimeExpr),
}

/// Overflow policy for a subscription's bounded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Close,
}

/// Frames a stream client may send; discriminated by `action`.
///
/// ```json
/// { "action": "subscribe", "id": "sub-1", "filter": { "min_level": "WARN" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        id: String,
        #[serde(default)]
        filter: StreamFilter,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<Since>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replay_limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overflow: Option<OverflowPolicy>,
    },
    Unsubscribe {
        id: String,
    },
    Ping,
}

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// Frames the server pushes; discriminated by `type`.
///
/// `Live` marks the replay-to-live transition: every record before it came
/// from storage replay, everything after arrives via the live fan-out, with
/// no duplicates across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Record { record: LogRecord },
    Batch { records: Vec<LogRecord> },
    Live,
    Dropped { count: u64 },
    Error { code: i64, message: String },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Metadata, RecordDraft};
    use chrono::Utc;

    fn record(level: Level, source: &str, message: &str) -> LogRecord {
        let draft = RecordDraft::new(level, source, message);
        LogRecord {
            id: 1,
            timestamp: Utc::now(),
            level: draft.level,
            source: draft.source,
            message: draft.message,
            metadata: Metadata::new(),
            tags: vec!["collector:test".to_owned()],
            trace_id: Some("t-1".to_owned()),
        }
    }

    #[test]
    fn stream_filter_applies_all_clauses() {
        let r = record(Level::Error, "http_requests", "GET /x failed");

        assert!(StreamFilter::default().matches(&r));
        assert!(StreamFilter {
            sources: vec!["http_requests".to_owned()],
            min_level: Some(Level::Warn),
            text: Some("FAILED".to_owned()),
            tags: vec!["collector:test".to_owned()],
            trace_id: Some("t-1".to_owned()),
            ..StreamFilter::default()
        }
        .matches(&r));

        assert!(!StreamFilter {
            sources: vec!["websocket".to_owned()],
            ..StreamFilter::default()
        }
        .matches(&r));
        assert!(!StreamFilter {
            min_level: Some(Level::Fatal),
            ..StreamFilter::default()
        }
        .matches(&r));
        assert!(!StreamFilter {
            levels: vec![Level::Info],
            ..StreamFilter::default()
        }
        .matches(&r));
        assert!(!StreamFilter {
            trace_id: Some("t-2".to_owned()),
            ..StreamFilter::default()
        }
        .matches(&r));
    }

    #[test]
    fn client_frames_use_action_discriminator() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"subscribe","id":"s1","since":"15m"}"#)
                .expect("parse");
        match frame {
            ClientFrame::Subscribe { id, since, .. } => {
                assert_eq!(id, "s1");
                assert!(matches!(since, Some(Since::Time(_))));
            }
            other => panic!("expected subscribe, got {other:?}"),
        }

        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"subscribe","id":"s2","since":41}"#).expect("parse");
        match frame {
            ClientFrame::Subscribe { since, .. } => {
                assert_eq!(since, Some(Since::LastId(41)));
            }
            other => panic!("expected subscribe, got {other:?}"),
        }

        assert_eq!(
            serde_json::from_str::<ClientFrame>(r#"{"action":"ping"}"#).expect("parse"),
            ClientFrame::Ping
        );
    }

    #[test]
    fn server_frames_use_type_discriminator() {
        assert_eq!(
            serde_json::to_string(&ServerFrame::Live).expect("serialize"),
            r#"{"type":"live"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerFrame::Dropped { count: 6 }).expect("serialize"),
            r#"{"type":"dropped","count":6}"#
        );
    }
}
