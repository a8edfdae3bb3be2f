//! Boundary server: JSON-RPC over `POST /rpc`, the live stream at
//! `GET /ws`, and a `/healthz` liveness probe.
//!
//! The HTTP collector's middleware wraps the whole router, so every request
//! against this surface (except the ignored prefixes) lands in the log
//! store via the `http_requests` source.

pub mod rpc;
pub mod ws;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let observer = state.http_observer.clone();
    Router::new()
        .route("/rpc", post(rpc::rpc_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .layer(axum::middleware::from_fn(
            move |req: axum::extract::Request, next: axum::middleware::Next| {
                let observer = observer.clone();
                async move { observer.observe(req, next).await }
            },
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
