// loghub-protocol: Canonical record model and wire types.
//
// Everything that crosses the service boundary lives here: the log record
// and its metadata tree, query/search/stats shapes, the WebSocket stream
// frames, and the JSON-RPC envelope.  WebSocket frames use a top-level
// discriminator field (`action` client-side, `type` server-side).

mod frames;
mod query;
mod record;
mod rpc;

pub use frames::{ClientFrame, OverflowPolicy, ServerFrame, Since, StreamFilter};
pub use query::{
    AnalysisKind, AnalysisParams, AnomaliesReport, AnomalyPoint, ErrorCluster, ErrorsReport,
    Highlight, Order, PatternsReport, PerfGroup, PerformanceReport, QueryFilter, QueryResult,
    SearchOptions, SearchResult, StatsBucket, StatsResult, TimeExpr, TimeExprError, TrendPoint,
    TrendsReport,
};
pub use record::{
    rfc3339_millis, rfc3339_millis_opt, Level, LevelParseError, LogRecord, MetaValue, Metadata,
    RecordDraft,
};
pub use rpc::{
    error_codes, CollectorCounters, CollectorState, CollectorStatus, HealthCheck, HealthResult,
    RpcError, RpcRequest, RpcResponse, StatusResult, ToggleParams, UpdateConfigParams,
    WriteBatchResult, WriteResult,
};
