//! In-process relay backend.
//!
//! Binds each requested local port on the loopback interface and relays
//! every accepted connection to `{upstream}:{remote port}`, where the
//! upstream host comes from a `{name}` / `{scope}` template. Upstream names
//! are resolved per connection via `tokio::net::lookup_host`.
//!
//! If the allocated local port has been taken since it was probed, the
//! session binds an OS-assigned port instead and reports it through
//! [`ReadySignal::notify_bound`].

use crate::config::RelaySection;
use futures_util::future::BoxFuture;
use podlink_core::{
    ForwardError, ForwardResult, ReadySignal, SessionRequest, TunnelSession, TunnelSessionFactory,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates sessions that relay straight to an upstream host.
#[derive(Debug, Clone)]
pub struct RelaySessionFactory {
    upstream: String,
    connect_timeout: Duration,
}

impl RelaySessionFactory {
    pub fn new(options: RelaySection) -> Self {
        Self {
            upstream: options.upstream,
            connect_timeout: Duration::from_secs(options.connect_timeout_secs),
        }
    }

    /// Upstream host for `request`, with `{name}` and `{scope}` substituted.
    pub fn upstream_host(&self, request: &SessionRequest) -> String {
        self.upstream
            .replace("{name}", &request.name)
            .replace("{scope}", &request.scope)
    }
}

impl TunnelSessionFactory for RelaySessionFactory {
    fn new_session(
        &self,
        cancel: CancellationToken,
        request: SessionRequest,
        ready: ReadySignal,
    ) -> ForwardResult<Box<dyn TunnelSession>> {
        if request.ports.is_empty() {
            return Err(ForwardError::SessionCreation("no ports to forward".to_string()));
        }

        let host = self.upstream_host(&request);
        let mut routes = Vec::with_capacity(request.ports.len());
        for mapping in &request.ports {
            let listener = bind_local(mapping.local).map_err(|e| {
                ForwardError::SessionCreation(format!("failed to bind local port {}: {e}", mapping.local))
            })?;
            routes.push(Route {
                listener,
                upstream_host: host.clone(),
                upstream_port: mapping.remote,
            });
        }

        Ok(Box::new(RelaySession {
            routes,
            cancel,
            ready,
            connect_timeout: self.connect_timeout,
        }))
    }
}

/// Bind `127.0.0.1:port`, falling back to an OS-assigned port if it is taken.
fn bind_local(port: u16) -> io::Result<TcpListener> {
    let listener = match std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!(port, "local port taken, binding an ephemeral port instead");
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?
        }
        Err(e) => return Err(e),
    };
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// One bound local port and where its connections go.
struct Route {
    listener: TcpListener,
    upstream_host: String,
    upstream_port: u16,
}

struct RelaySession {
    routes: Vec<Route>,
    cancel: CancellationToken,
    ready: ReadySignal,
    connect_timeout: Duration,
}

impl TunnelSession for RelaySession {
    fn forward(self: Box<Self>) -> BoxFuture<'static, ForwardResult<()>> {
        Box::pin(async move {
            let RelaySession {
                routes,
                cancel,
                ready,
                connect_timeout,
            } = *self;

            // The first mapping is the one the forwarder redirects to.
            match routes.first().map(|r| r.listener.local_addr()) {
                Some(Ok(addr)) => ready.notify_bound(addr.port()),
                Some(Err(e)) => return Err(ForwardError::Session(e.to_string())),
                None => return Ok(()),
            }

            let mut accept_loops = JoinSet::new();
            for route in routes {
                accept_loops.spawn(accept_loop(route, cancel.clone(), connect_timeout));
            }

            while let Some(result) = accept_loops.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "relay accept loop panicked");
                }
            }
            Ok(())
        })
    }
}

/// Accept connections on a route until cancelled.
async fn accept_loop(route: Route, cancel: CancellationToken, connect_timeout: Duration) {
    let Route {
        listener,
        upstream_host,
        upstream_port,
    } = route;

    if let Ok(local) = listener.local_addr() {
        let upstream = format!("{upstream_host}:{upstream_port}");
        info!(local = %local, upstream = %upstream, "relay listening");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(upstream = %upstream_host, "relay accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, upstream = %upstream_host, "inbound connection accepted");
                        let host = upstream_host.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay_connection(stream, &host, upstream_port, connect_timeout, cancel).await {
                                warn!(peer = %peer, upstream = %host, error = %e, "relay failed");
                            }
                        });
                    }
                    Err(e) => crate::proxy::back_off_after_accept_error(&e).await,
                }
            }
        }
    }
}

/// Connect to the upstream and copy bytes both ways until either side closes
/// or the session is cancelled.
async fn relay_connection(
    mut inbound: TcpStream,
    host: &str,
    port: u16,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> io::Result<()> {
    let candidates = resolve_upstream(host, port).await?;

    let mut outbound = None;
    let mut last_err = None;
    for addr in candidates {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                outbound = Some(stream);
                break;
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            }
        }
    }
    let mut outbound = match outbound {
        Some(stream) => stream,
        None => {
            return Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
            }))
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(upstream = %host, "relay cancelled");
        }
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            let (sent, received) = result?;
            debug!(upstream = %host, sent, received, "relay ended");
        }
    }
    Ok(())
}

/// Resolve `host:port` to socket addresses.
async fn resolve_upstream(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        ));
    }
    debug!(host = %host, count = addrs.len(), "resolved upstream");
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlink_core::PortMapping;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn factory(upstream: &str) -> RelaySessionFactory {
        RelaySessionFactory::new(RelaySection {
            upstream: upstream.to_string(),
            connect_timeout_secs: 2,
        })
    }

    fn request(local: u16, remote: u16) -> SessionRequest {
        SessionRequest {
            scope: "ns1".to_string(),
            name: "podA".to_string(),
            ports: vec![PortMapping { local, remote }],
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[test]
    fn upstream_template_substitution() {
        let f = factory("{name}.{scope}.svc.cluster.local");
        assert_eq!(f.upstream_host(&request(0, 80)), "podA.ns1.svc.cluster.local");
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = resolve_upstream("localhost", 80).await.unwrap();
        assert!(!addrs.is_empty(), "localhost should have at least one address");
        assert!(addrs.iter().all(|a| a.port() == 80));
    }

    #[tokio::test]
    async fn test_resolve_invalid() {
        let result = resolve_upstream("this.host.definitely.does.not.exist.invalid", 80).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn relays_to_upstream() {
        let upstream_port = echo_server().await;
        let cancel = CancellationToken::new();
        let (ready, rx) = ReadySignal::new();
        let session = factory("127.0.0.1")
            .new_session(cancel.clone(), request(0, upstream_port), ready)
            .unwrap();
        let forward = tokio::spawn(session.forward());

        let local_port = rx.await.unwrap().unwrap();
        let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), forward)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn taken_port_falls_back_to_ephemeral() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let (ready, rx) = ReadySignal::new();
        let session = factory("127.0.0.1")
            .new_session(cancel.clone(), request(taken_port, 80), ready)
            .unwrap();
        let forward = tokio::spawn(session.forward());

        let bound = rx.await.unwrap().unwrap();
        assert_ne!(bound, taken_port);

        cancel.cancel();
        forward.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let (ready, _rx) = ReadySignal::new();
        let mut req = request(0, 80);
        req.ports.clear();
        let err = factory("127.0.0.1")
            .new_session(CancellationToken::new(), req, ready)
            .err()
            .unwrap();
        assert!(matches!(err, ForwardError::SessionCreation(_)));
    }
}
