// loghub: Log collection, storage, query, and streaming service.

use loghub::config;
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config_path = env::var("LOGHUB_CONFIG")
        .map_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_PATH), PathBuf::from);
    let cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "loghub starting");

    let bind_addr = format!("{}:{}", cfg.host, cfg.port);
    let service = match loghub::build_service(cfg).await {
        Ok(service) => service,
        Err(e) => {
            // Schema mismatch and unrecoverable corruption land here.
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let router = loghub::build_router(service.state.clone());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "server listening");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }

    // Server stopped accepting; now stop collectors and drain the pipeline.
    service.shutdown().await;
    info!("loghub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
