//! `nsvault` server entry point.
//!
//! Initializes an engine over in-memory storage, then starts the Axum HTTP
//! server with graceful shutdown. On SIGINT or SIGTERM the engine is shut
//! down so in-flight and later requests fail cleanly.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use nsvault_core::Core;
use nsvault_storage::{MemoryBackend, StorageBackend};

use nsvault_server::config::ServerConfig;
use nsvault_server::routes;
use nsvault_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(config = ?config, "nsvault starting");

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    info!("using in-memory storage (data will not persist)");

    let (core, root_token) = match &config.dev_root_token {
        Some(token) => Core::initialize_with_root_token(storage, config.core_config(), token).await,
        None => Core::initialize(storage, config.core_config()).await,
    }
    .context("failed to initialize engine")?;
    if config.dev_root_token.is_none() {
        announce_root_token(&root_token);
    }

    let state = Arc::new(AppState::new(core));
    let app = routes::router(Arc::clone(&state), config.max_concurrent_requests);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "nsvault server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .context("server error")?;

    info!("nsvault server stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then shut the engine down.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    state.core.shutdown();
}

/// Show the generated root token once, outside the structured log stream.
#[allow(clippy::print_stderr)]
fn announce_root_token(token: &str) {
    eprintln!("Root token (shown once, store it safely): {token}");
}
