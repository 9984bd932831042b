use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use fleet_control::{
    api::{control_router, http_router, AppState},
    artifacts::ArtifactLibrary,
    config::ServerConfig,
    inbox::InboxProcessor,
    logging::init_logging,
    registry::AgentRegistry,
    store::SqliteStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = ServerConfig::parse();
    init_logging(&cfg.log_level)?;

    let store = SqliteStore::open_with_retry(
        &cfg.database,
        cfg.db_connect_attempts,
        cfg.db_retry_delay(),
    )
    .await
    .with_context(|| format!("failed to open database {}", cfg.database.display()))?;
    if let Some(path) = &cfg.schema_file {
        let sql = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        store
            .apply_schema(&sql)
            .with_context(|| format!("failed to apply schema file {}", path.display()))?;
    }
    let store = Arc::new(store);
    tracing::info!(
        target = "fleet_control::server",
        database = %cfg.database.display(),
        "database ready"
    );

    if !cfg.artifact_dir.is_dir() {
        tracing::warn!(
            target = "fleet_control::server",
            dir = %cfg.artifact_dir.display(),
            "artifact directory missing; script listing will fail until it exists"
        );
    }

    let registry = Arc::new(AgentRegistry::new());
    let state = AppState::new(
        store.clone(),
        registry,
        ArtifactLibrary::new(&cfg.artifact_dir),
        cfg.chunk_size,
        cfg.max_inbox_bytes,
    );

    let control_addr = cfg.control_addr();
    let control_listener = tokio::net::TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("failed to bind control plane on {control_addr}"))?;
    let http_addr = cfg.http_addr();
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API on {http_addr}"))?;
    tracing::info!(target = "fleet_control::server", addr = %control_addr, "control plane listening");
    tracing::info!(target = "fleet_control::server", addr = %http_addr, "HTTP API listening");

    let cancel = CancellationToken::new();

    let control = {
        let cancel = cancel.clone();
        let app = control_router(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(control_listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!(target = "fleet_control::server", error = %e, "control plane server error");
            }
        })
    };

    let http = {
        let cancel = cancel.clone();
        let app = http_router(state);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!(target = "fleet_control::server", error = %e, "HTTP API server error");
            }
        })
    };

    let processor = Arc::new(InboxProcessor::new(store.clone(), store));
    let scanner = tokio::spawn(processor.run(cfg.inbox_interval(), cancel.clone()));

    shutdown_signal().await?;
    tracing::info!(target = "fleet_control::server", "shutting down");
    cancel.cancel();

    // Open agent sockets keep the control server alive; stop waiting for them.
    control.abort();
    let _ = tokio::join!(http, scanner);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
