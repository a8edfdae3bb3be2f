//! JSON-RPC 2.0 dispatch for the control/query surface.
//!
//! Every call is reported to the `mcp_calls` collector, so the service's
//! own RPC traffic shows up in the store with paired request/response
//! records. Error payloads are re-run through the sanitizer before they
//! leave the process.

use crate::api::{ApiError, OpContext};
use crate::collector::CollectorSetError;
use crate::pipeline::{Enqueued, ItemOutcome};
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use base64::Engine as _;
use loghub_protocol::{
    error_codes, AnalysisParams, QueryFilter, RecordDraft, RpcError, RpcRequest, RpcResponse,
    SearchOptions, TimeExpr, ToggleParams, UpdateConfigParams, WriteBatchResult, WriteResult,
};
use serde::Deserialize;
use std::io::Read;
use tracing::debug;
use uuid::Uuid;

pub async fn rpc_handler(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Json<RpcResponse> {
    Json(handle(&state, &body).await)
}

async fn handle(state: &AppState, body: &[u8]) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return RpcResponse::failure(
                serde_json::Value::Null,
                RpcError::new(error_codes::PARSE, format!("parse error: {e}")),
            )
        }
    };
    if request.jsonrpc != "2.0" {
        return RpcResponse::failure(
            request.id.unwrap_or(serde_json::Value::Null),
            RpcError::new(error_codes::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        );
    }
    let id = request.id.clone().unwrap_or(serde_json::Value::Null);

    // Observe the call through the RPC collector.
    let call_id = Uuid::new_v4().to_string();
    state
        .rpc_observer
        .request_started(&call_id, &request.method)
        .await;

    let result = dispatch(state, &request.method, request.params).await;

    state
        .rpc_observer
        .request_finished(
            &call_id,
            result.is_ok(),
            result.as_ref().err().map(|e| e.message.as_str()),
        )
        .await;

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(mut error) => {
            // Never leak secrets through error detail objects.
            error.data = error.data.map(|data| state.sanitizer.sanitize_json(data));
            RpcResponse::failure(id, error)
        }
    }
}

// ---------------------------------------------------------------------------
// Method dispatch
// ---------------------------------------------------------------------------

async fn dispatch(
    state: &AppState,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    debug!(method, "rpc dispatch");
    match method {
        "log.write" => log_write(state, params).await,
        "log.writeBatch" => log_write_batch(state, params).await,
        "log.query" => log_query(state, params).await,
        "log.search" => log_search(state, params).await,
        "log.stats" => log_stats(state, params).await,
        "log.analysis" => log_analysis(state, params).await,
        "system.status" => Ok(encode(&state.status().await)?),
        "system.health" => Ok(encode(&state.health().await)?),
        "collector.toggle" => collector_toggle(state, params).await,
        "collector.updateConfig" => collector_update_config(state, params).await,
        other => Err(RpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        )),
    }
}

async fn log_write(state: &AppState, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let draft: RecordDraft = decode_params(params)?;
    let (_, ack) = state.ingest.submit_with_ack(draft).await;
    let timeout = state.api.default_timeout;
    let outcome = tokio::time::timeout(timeout, ack)
        .await
        .map_err(|_| RpcError::new(error_codes::CANCELLED, "cancelled: write timed out"))?
        .map_err(|_| RpcError::new(error_codes::INTERNAL, "ingest pipeline is gone"))?;
    match outcome {
        ItemOutcome::Stored(id) => Ok(encode(&WriteResult { id })?),
        // Drop-pattern drops are silent by contract: id 0 signals "accepted
        // but filtered", never an error.
        ItemOutcome::DroppedFilter => Ok(encode(&WriteResult { id: 0 })?),
        ItemOutcome::DroppedRateLimited => Err(RpcError::new(
            error_codes::RATE_LIMITED,
            "rate_limited: source over its ingest budget",
        )),
        ItemOutcome::DroppedBuffer => Err(RpcError::new(
            error_codes::BUSY,
            "busy: ingest buffer full",
        )),
        ItemOutcome::StorageUnavailable => Err(RpcError::new(
            error_codes::INTERNAL,
            "storage_unavailable: record dead-lettered",
        )),
    }
}

async fn log_write_batch(
    state: &AppState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let drafts = decode_batch(&params)?;
    let max_batch = state.config.load().ingest.batch_size;
    if drafts.is_empty() {
        return Err(RpcError::new(
            error_codes::INVALID_PARAMS,
            "records must not be empty",
        ));
    }
    if drafts.len() > max_batch {
        return Err(RpcError::new(
            error_codes::INVALID_PARAMS,
            format!("batch accepts up to {max_batch} records, got {}", drafts.len()),
        ));
    }

    let mut acks = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let (enqueued, ack) = state.ingest.submit_with_ack(draft).await;
        if enqueued == Enqueued::DroppedOldest {
            debug!("ingest buffer evicted its oldest record during batch write");
        }
        acks.push(ack);
    }

    let timeout = state.api.default_timeout;
    let mut ids = Vec::new();
    let mut dropped = 0u64;
    let mut unavailable = false;
    for ack in acks {
        let outcome = tokio::time::timeout(timeout, ack)
            .await
            .map_err(|_| RpcError::new(error_codes::CANCELLED, "cancelled: write timed out"))?
            .map_err(|_| RpcError::new(error_codes::INTERNAL, "ingest pipeline is gone"))?;
        match outcome {
            ItemOutcome::Stored(id) => ids.push(id),
            ItemOutcome::DroppedFilter
            | ItemOutcome::DroppedRateLimited
            | ItemOutcome::DroppedBuffer => dropped += 1,
            ItemOutcome::StorageUnavailable => unavailable = true,
        }
    }
    if unavailable {
        return Err(RpcError::new(
            error_codes::INTERNAL,
            "storage_unavailable: batch dead-lettered after retries",
        ));
    }
    let written = ids.len() as u64;
    Ok(encode(&WriteBatchResult {
        ids,
        written,
        dropped,
    })?)
}

/// Batch payloads come in plain (`records: [...]`) or compressed
/// (`compress: true, records: "<base64 gzip of the JSON array>"`).
fn decode_batch(params: &serde_json::Value) -> Result<Vec<RecordDraft>, RpcError> {
    let compress = params
        .get("compress")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let records = params
        .get("records")
        .ok_or_else(|| RpcError::new(error_codes::INVALID_PARAMS, "missing 'records'"))?;

    if !compress {
        return serde_json::from_value(records.clone()).map_err(|e| {
            RpcError::new(error_codes::INVALID_PARAMS, format!("invalid records: {e}"))
        });
    }

    let blob = records.as_str().ok_or_else(|| {
        RpcError::new(
            error_codes::INVALID_PARAMS,
            "compressed records must be a base64 string",
        )
    })?;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| RpcError::new(error_codes::INVALID_PARAMS, format!("invalid base64: {e}")))?;
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| RpcError::new(error_codes::INVALID_PARAMS, format!("invalid gzip: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| RpcError::new(error_codes::INVALID_PARAMS, format!("invalid records: {e}")))
}

async fn log_query(state: &AppState, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let filter: QueryFilter = decode_params(params)?;
    let result = state
        .api
        .query(&filter, OpContext::with_timeout(state.api.default_timeout))
        .await
        .map_err(api_error)?;
    Ok(encode(&result)?)
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

async fn log_search(state: &AppState, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let params: SearchParams = decode_params(params)?;
    let result = state
        .api
        .search(
            &params.query,
            &params.options,
            OpContext::with_timeout(state.api.default_timeout),
        )
        .await
        .map_err(api_error)?;
    Ok(encode(&result)?)
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    #[serde(default)]
    timerange: Option<TimeExpr>,
}

async fn log_stats(state: &AppState, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let params: StatsParams = decode_params(params)?;
    let result = state
        .api
        .stats(
            params.timerange.as_ref(),
            OpContext::with_timeout(state.api.default_timeout),
        )
        .await
        .map_err(api_error)?;
    Ok(encode(&result)?)
}

async fn log_analysis(
    state: &AppState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let params: AnalysisParams = decode_params(params)?;
    state
        .api
        .analysis(&params, OpContext::with_timeout(state.api.default_timeout))
        .await
        .map_err(api_error)
}

async fn collector_toggle(
    state: &AppState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let params: ToggleParams = decode_params(params)?;
    state
        .collectors
        .toggle(&params.name, params.enabled)
        .await
        .map_err(collector_error)?;
    Ok(serde_json::json!({ "name": params.name, "enabled": params.enabled }))
}

async fn collector_update_config(
    state: &AppState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let params: UpdateConfigParams = decode_params(params)?;
    state
        .collectors
        .update_config(&params.name, params.patch)
        .await
        .map_err(collector_error)?;
    Ok(serde_json::json!({ "name": params.name, "updated": true }))
}

// ---------------------------------------------------------------------------
// Error / codec helpers
// ---------------------------------------------------------------------------

fn decode_params<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(error_codes::INVALID_PARAMS, format!("invalid params: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::new(error_codes::INTERNAL, format!("encode: {e}")))
}

fn api_error(e: ApiError) -> RpcError {
    let code = match &e {
        ApiError::InvalidParams(_) => error_codes::INVALID_PARAMS,
        ApiError::Busy => error_codes::BUSY,
        ApiError::Cancelled => error_codes::CANCELLED,
        ApiError::NotFound(_) => error_codes::NOT_FOUND,
        ApiError::Internal(_) => error_codes::INTERNAL,
    };
    RpcError::new(code, e.to_string())
}

fn collector_error(e: CollectorSetError) -> RpcError {
    let code = match &e {
        CollectorSetError::NotFound(_) => error_codes::NOT_FOUND,
        CollectorSetError::Rejected(_) => error_codes::INVALID_PARAMS,
    };
    RpcError::new(code, e.to_string())
}
