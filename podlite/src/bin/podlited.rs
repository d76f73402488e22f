//! podlite daemon: runs the pod manager until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use podlite::daemon::{self, DaemonConfig};
use podlite::network::BindMountNamespaces;
use podlite::util;
use podlite_shared::container::{set_child_subreaper, LibcontainerFactory};
use tokio::signal::unix::{signal, SignalKind};

/// Libcontainer state lives here, inside the pods directory.
const CONTAINER_STATE_DIR: &str = "libcontainer";

#[derive(Parser, Debug)]
#[command(author, version, about = "podlite pod runtime daemon")]
struct DaemonArgs {
    /// Configuration file (JSON or YAML)
    #[arg(long, env = "PODLITE_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, env = "PODLITE_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DaemonArgs::parse();

    let mut config = DaemonConfig::load(&args.config)?;
    config.debug |= args.debug;

    let _log_guard = util::init_logging(config.debug, config.log_directory.as_deref())?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "podlited starting");

    set_child_subreaper()?;
    let factory = LibcontainerFactory::new(config.pods_directory.join(CONTAINER_STATE_DIR))
        .context("failed to create the container factory")?;

    let daemon = daemon::bootstrap(&config, Arc::new(factory), Arc::new(BindMountNamespaces)).await?;
    tracing::info!(pods = daemon.pods.pods().len(), "podlited ready");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    tracing::info!(signal = received, "Shutting down");
    daemon.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
