//! Outbound connection factories used by the forwarder.

use futures_util::future::BoxFuture;
use std::io;
use tokio::net::{lookup_host, TcpStream};

/// Opens a connection to a resolved local endpoint.
///
/// The forwarder wraps every call with the caller's cancellation and deadline,
/// so implementations do not need to watch for either.
pub trait Dialer: Send + Sync {
    type Conn: Send + 'static;

    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> BoxFuture<'a, io::Result<Self::Conn>>;
}

/// Plain TCP dialer supporting the `tcp`, `tcp4` and `tcp6` networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> BoxFuture<'a, io::Result<TcpStream>> {
        Box::pin(async move {
            let want_v4 = match network {
                "tcp" => None,
                "tcp4" => Some(true),
                "tcp6" => Some(false),
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsupported network: {other}"),
                    ))
                }
            };

            let mut last_err = None;
            for candidate in lookup_host(addr).await? {
                if want_v4.is_some_and(|v4| candidate.is_ipv4() != v4) {
                    continue;
                }
                match TcpStream::connect(candidate).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }

            Err(last_err.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no {network} address found for {addr}"),
                )
            }))
        })
    }
}
