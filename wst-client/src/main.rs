//! wst client - tunnel a local TCP port or stdio through a wst server.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wst_client::tunnel::{is_rejected, local_endpoint};
use wst_client::{ClientConfig, ClientContext, ClientEvent, TunnelClient};
use wst_core::privilege::{Chroot, PrivilegeDrop};
use wst_core::TunnelSpec;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();
    let stdio = matches!(config.tunnel, TunnelSpec::Stdio { .. });

    // In stdio mode stdout carries tunnel data, so logs go to stderr.
    let builder = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false);
    if stdio {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }

    let ctx = ClientContext::from_config(&config)?;
    debug!("Starting wst-client v{}", env!("CARGO_PKG_VERSION"));
    debug!("Server: {}", ctx.server_url);
    match &ctx.target {
        Some(target) => debug!("Destination: {}", target),
        None => debug!("No destination requested, server must be locked"),
    }

    let (client, events) = TunnelClient::new(ctx);
    let logger = tokio::spawn(log_events(events));

    let chroot = Chroot::from_options(config.chroot.as_ref(), config.chuser.as_deref());

    match local_endpoint(&config.tunnel) {
        Some(local) => {
            let listener = TunnelClient::bind(local).await?;
            info!("Listening on {}", listener.local_addr()?);
            drop_privileges(chroot.as_ref())?;

            tokio::select! {
                result = client.serve(listener) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
            }
        }
        None => {
            drop_privileges(chroot.as_ref())?;
            let result = client
                .run_stdio(tokio::io::stdin(), tokio::io::stdout())
                .await;
            // Flush the remaining events before leaving.
            drop(client);
            let _ = logger.await;
            // A pending blocking stdin read would otherwise hold the runtime open.
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
    }

    Ok(())
}

fn drop_privileges(chroot: Option<&Chroot>) -> Result<()> {
    if let Some(chroot) = chroot {
        if chroot.apply()? {
            info!("{}", chroot.describe());
        } else {
            warn!("Not running as root, skipping chroot");
        }
    }
    Ok(())
}

async fn log_events(mut events: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::TunnelEstablished {
                session,
                local,
                kind,
            } => {
                info!(
                    "Session {} from {}: {} tunnel established",
                    session.short(),
                    local,
                    kind
                );
            }
            ClientEvent::ConnectFailed {
                session,
                local,
                error,
            } => {
                if is_rejected(&error) {
                    warn!("Session {} from {}: {}", session.short(), local, error.message);
                } else {
                    error!("Session {} from {}: {}", session.short(), local, error);
                }
            }
            ClientEvent::TunnelClosed { session, report } => match report.failure() {
                Some(e) => debug!("Session {} closed: {}", session.short(), e),
                None => debug!(
                    "Session {} closed ({} bytes up, {} bytes down)",
                    session.short(),
                    report.a_to_b,
                    report.b_to_a
                ),
            },
        }
    }
}
