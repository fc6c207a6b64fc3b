//! HTTP API server command.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use agentvm::api::state::ApiState;
use agentvm::api::sweeper::Sweeper;
use agentvm::config::AgentvmConfig;
use agentvm::error::Error;
use agentvm::Result;

/// Start the runtime controller and its HTTP API server.
#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Listen address. Overrides `[server].listen`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Configuration file (default: ~/.config/agentvm/config.toml).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self) -> Result<()> {
        let config = AgentvmConfig::load(self.config.as_deref())?;

        let listen = self.listen.unwrap_or_else(|| config.server.listen.clone());
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| Error::config(format!("invalid listen address '{}': {}", listen, e)))?;

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(run_server(config, addr))
    }
}

async fn run_server(config: AgentvmConfig, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(ApiState::with_runtime(config.runtime.clone()));

    // Register statically configured VMs. A VM that cannot be reached is
    // skipped so the rest stay manageable.
    for spec in &config.vms {
        match state.register_firecracker(spec).await {
            Ok(()) => tracing::info!(vm_id = %spec.name, "registered VM from config"),
            Err(e) => {
                tracing::warn!(vm_id = %spec.name, error = %e, "failed to register VM from config")
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(Sweeper::new(state.supervisor().clone(), shutdown_rx).run());

    let app = agentvm::api::create_router(state.clone(), config.server.request_timeout);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, vms = state.supervisor().len(), "starting HTTP API server");
    println!("agentvm API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task failed");
    }
    tracing::info!("server stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT");
    }
}
