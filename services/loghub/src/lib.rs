// loghub: Library entry point.
// Exposes modules for integration testing.

pub mod api;
pub mod broker;
pub mod collector;
pub mod config;
pub mod deadletter;
pub mod filter;
pub mod http;
pub mod pipeline;
pub mod state;
pub mod storage;

pub use http::build_router;
pub use state::{build_service, AppState, Service};
