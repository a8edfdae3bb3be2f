use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 envelope
// ---------------------------------------------------------------------------

/// Frozen error codes for the `/rpc` surface.
///
/// | Code   | Meaning          |
/// |--------|------------------|
/// | -32700 | parse error      |
/// | -32600 | invalid request  |
/// | -32601 | method not found |
/// | -32602 | invalid params   |
/// | -32603 | internal error   |
/// | -32001 | not_found        |
/// | -32002 | busy             |
/// | -32003 | rate_limited     |
/// | -32004 | cancelled        |
pub mod error_codes {
    pub const PARSE: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const NOT_FOUND: i64 = -32001;
    pub const BUSY: i64 = -32002;
    pub const RATE_LIMITED: i64 = -32003;
    pub const CANCELLED: i64 = -32004;
}

/// An incoming JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// An outgoing JSON-RPC 2.0 response (exactly one of `result`/`error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: serde_json::Value, error: RpcError) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

// ---------------------------------------------------------------------------
// Method result shapes
// ---------------------------------------------------------------------------

/// `log.write` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: u64,
}

/// `log.writeBatch` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatchResult {
    pub ids: Vec<u64>,
    pub written: u64,
    pub dropped: u64,
}

/// `collector.toggle` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleParams {
    pub name: String,
    pub enabled: bool,
}

/// `collector.updateConfig` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigParams {
    pub name: String,
    pub patch: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Collector status
// ---------------------------------------------------------------------------

/// Collector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Paused,
}

impl CollectorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectorState::Stopped => "stopped",
            CollectorState::Starting => "starting",
            CollectorState::Running => "running",
            CollectorState::Stopping => "stopping",
            CollectorState::Error => "error",
            CollectorState::Paused => "paused",
        }
    }
}

/// Snapshot of one collector's counters.
///
/// `extras` carries source-specific rollups (per-method means for the RPC
/// collector, byte counters for WebSocket, and so on) flattened into the
/// same JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectorCounters {
    pub records_collected: u64,
    pub errors: u64,
    /// Records offered while the collector was not `running`.
    pub dropped_not_running: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// Per-collector entry in `system.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub state: CollectorState,
    pub retries_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub counters: CollectorCounters,
}

/// `system.status` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub server_status: String,
    pub total_logs: u64,
    pub disk_usage_mb: f64,
    pub memory_usage_mb: f64,
    pub uptime_seconds: u64,
    pub started_at: String,
    pub collectors: BTreeMap<String, CollectorStatus>,
    /// Ingest pipeline counters (accepted, dropped_*, dead_letter, distinct traces).
    pub ingest: BTreeMap<String, u64>,
}

/// One entry in `system.health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `system.health` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResult {
    pub ok: bool,
    pub checks: Vec<HealthCheck>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_omits_the_unused_arm() {
        let ok = RpcResponse::success(serde_json::json!(1), serde_json::json!({"id": 7}));
        let json = serde_json::to_value(&ok).expect("serialize");
        assert_eq!(json["jsonrpc"], "2.0");
        assert!(json.get("error").is_none());

        let err = RpcResponse::failure(
            serde_json::Value::Null,
            RpcError::new(error_codes::BUSY, "busy"),
        );
        let json = serde_json::to_value(&err).expect("serialize");
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32002);
    }

    #[test]
    fn collector_counters_flatten_extras() {
        let mut counters = CollectorCounters {
            records_collected: 3,
            ..CollectorCounters::default()
        };
        counters
            .extras
            .insert("bytes_in".to_owned(), serde_json::json!(128));
        let json = serde_json::to_value(&counters).expect("serialize");
        assert_eq!(json["records_collected"], 3);
        assert_eq!(json["bytes_in"], 128);
    }
}
