//! Local proxy listener.
//!
//! Accepts plain TCP connections on a local address and, for each one,
//! dials the pod through [`Forwarder::dial_timeout`] and copies bytes in both
//! directions. Callers that cannot be taught to dial symbolic addresses can
//! point at this listener instead.

use crate::policy::ProxyPolicyEnforcer;
use podlink_core::Forwarder;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed `accept()` so persistent errors such as `EMFILE`
/// do not spin the loop.
pub(crate) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) async fn back_off_after_accept_error(error: &io::Error) {
    warn!(error = %error, "accept failed");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Accept loop for the local proxy. Returns once `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    forwarder: Arc<Forwarder>,
    policy: Arc<ProxyPolicyEnforcer>,
    dial_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut next_conn_id: u64 = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("proxy accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let conn_id = next_conn_id;
                        next_conn_id += 1;

                        if let Err(reason) = policy.check_connect() {
                            warn!(conn_id, peer = %peer, reason = %reason, "connection rejected");
                            continue;
                        }
                        let guard = policy.acquire();

                        info!(
                            conn_id,
                            peer = %peer,
                            addr = %forwarder.addr(),
                            active = policy.active_connections(),
                            "inbound connection accepted"
                        );

                        let forwarder = forwarder.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            let _guard = guard; // keep alive for connection counting
                            proxy_connection(conn_id, stream, &forwarder, dial_timeout, &cancel).await;
                            debug!(conn_id, "proxied connection ended");
                        });
                    }
                    Err(e) => back_off_after_accept_error(&e).await,
                }
            }
        }
    }
}

async fn proxy_connection(
    conn_id: u64,
    mut inbound: TcpStream,
    forwarder: &Forwarder,
    dial_timeout: Duration,
    cancel: &CancellationToken,
) {
    let mut outbound = match forwarder.dial_timeout(cancel, dial_timeout).await {
        Ok(stream) => stream,
        Err(e) if e.is_context_error() => {
            debug!(conn_id, error = %e, "redirected dial abandoned");
            return;
        }
        Err(e) => {
            warn!(conn_id, addr = %forwarder.addr(), error = %e, "redirected dial failed");
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(conn_id, "proxied connection cancelled");
        }
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            match result {
                Ok((sent, received)) => debug!(conn_id, sent, received, "proxied connection closed"),
                Err(e) => debug!(conn_id, error = %e, "proxied connection error"),
            }
        }
    }
}
