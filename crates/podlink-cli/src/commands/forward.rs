//! `podlink forward <ADDR>`: redirect a local listener to a pod until
//! interrupted or until the tunnel ends.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::policy::{ProxyPolicy, ProxyPolicyEnforcer};
use crate::proxy;

pub async fn run(addr: &str, settings: &Settings) -> Result<()> {
    let forwarder = super::build_forwarder(addr, settings)?;

    let policy = Arc::new(ProxyPolicyEnforcer::new(ProxyPolicy {
        allowed_scopes: settings.allowed_scopes.clone(),
        max_connections: settings.max_connections,
    }));
    policy
        .check_target(forwarder.target())
        .map_err(|reason| anyhow!("refusing to forward to '{addr}': {reason}"))?;

    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("failed to listen on {}", settings.listen))?;
    let local = listener.local_addr()?;
    info!(listen = %local, addr = %addr, "forwarding");
    println!("Forwarding {local} -> {addr}");

    let cancel = CancellationToken::new();
    let mut run = forwarder.spawn(cancel.clone());
    let proxy = tokio::spawn(proxy::serve(
        listener,
        forwarder.clone(),
        policy,
        settings.dial_timeout,
        cancel.clone(),
    ));

    let finished = tokio::select! {
        _ = crate::shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        result = &mut run => Some(result),
    };

    cancel.cancel();
    let result = match finished {
        Some(result) => result,
        None => run.await,
    };
    join_proxy(proxy).await;

    result
        .context("forwarder task panicked")?
        .with_context(|| format!("port-forward to '{addr}' ended"))?;
    Ok(())
}

/// Wait for the proxy task, logging a panic instead of dropping it.
/// Returns whether it shut down cleanly.
async fn join_proxy(proxy: JoinHandle<()>) -> bool {
    match proxy.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "proxy accept loop panicked");
            false
        }
    }
}
