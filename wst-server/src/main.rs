//! wst server - relay WebSocket and long-poll tunnels to TCP destinations.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wst_core::privilege::{Chroot, PrivilegeDrop};
use wst_server::{tunnel, ServerConfig, TunnelServer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting wst-server v{}", env!("CARGO_PKG_VERSION"));
    match &config.tunnel {
        Some(lock) => info!("Locked to destination {}", lock),
        None => info!("Destinations taken from client tokens"),
    }
    if config.auth_context().shared_secret.is_some() {
        info!("Signed destinations required");
    }

    let listener = tunnel::bind(&config.server).await?;
    info!("Listening on {}", listener.local_addr()?);

    if let Some(chroot) = Chroot::from_options(config.chroot.as_ref(), config.chuser.as_deref()) {
        if chroot.apply()? {
            info!("{}", chroot.describe());
        } else {
            warn!("Not running as root, skipping chroot");
        }
    }

    let server = Arc::new(TunnelServer::new(&config));
    let handle = tokio::spawn(async move {
        if let Err(e) = tunnel::serve(listener, server).await {
            tracing::error!("Server error: {}", e);
        }
    });

    info!("Server is ready to accept connections");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.abort();

    Ok(())
}
