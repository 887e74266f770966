//! `podlink probe <ADDR>`: open the tunnel, dial through it once, tear down.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;

pub async fn run(addr: &str, settings: &Settings, timeout: Duration) -> Result<()> {
    let forwarder = super::build_forwarder(addr, settings)?;
    let cancel = CancellationToken::new();
    let run = forwarder.spawn(cancel.clone());

    let dialed = forwarder
        .dial_timeout(&CancellationToken::new(), timeout)
        .await;

    cancel.cancel();
    let run_result = run.await.context("forwarder task panicked")?;

    let stream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            // A run failure explains the dial failure better.
            run_result.with_context(|| format!("port-forward to '{addr}' failed"))?;
            return Err(e).with_context(|| format!("could not reach '{addr}'"));
        }
    };

    let via = stream.peer_addr().context("connection has no peer address")?;
    info!(addr = %addr, via = %via, "probe succeeded");
    println!("{addr} reachable via {via}");
    Ok(())
}
