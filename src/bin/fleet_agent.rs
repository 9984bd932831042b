use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use url::Url;

use fleet_control::{
    agent::{AgentClient, AgentIdentity, ArtifactHandler, DiskArtifactHandler, ProcessLauncher},
    config::AgentConfig,
    error::AgentError,
    logging::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AgentConfig::parse();
    init_logging(&cfg.log_level)?;

    let server = Url::parse(&cfg.server_url)
        .map_err(|_| AgentError::InvalidUrl(cfg.server_url.clone()))?;
    if !matches!(server.scheme(), "ws" | "wss") {
        return Err(AgentError::InvalidUrl(cfg.server_url.clone()).into());
    }

    let workplace = cfg.workplace_dir();
    std::fs::create_dir_all(&workplace)
        .with_context(|| format!("failed to create workplace {}", workplace.display()))?;
    let identity = AgentIdentity::resolve(&workplace, &server, cfg.hostname.as_deref())
        .context("failed to resolve agent identity")?;
    tracing::info!(
        target = "fleet_control::agent",
        agent_id = %identity.agent_id,
        hostname = %identity.hostname,
        address = %identity.address,
        workplace = %workplace.display(),
        execute = cfg.execute,
        "agent starting"
    );

    let mut handler = DiskArtifactHandler::new(&workplace);
    if cfg.execute {
        handler = handler.with_launcher(Arc::new(ProcessLauncher));
    }
    let handler: Arc<dyn ArtifactHandler> = Arc::new(handler);
    let client = AgentClient::new(server.as_str(), identity, handler)
        .with_max_attempts(cfg.max_reconnect_attempts);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target = "fleet_control::agent", "interrupt received");
            stopper.cancel();
        }
    });

    client.run(cancel).await?;
    tracing::info!(target = "fleet_control::agent", "agent stopped");
    Ok(())
}
