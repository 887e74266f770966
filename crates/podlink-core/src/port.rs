//! Local port allocation for tunnel endpoints.
//!
//! The default finder binds `127.0.0.1:0`, reads back the port the OS picked
//! and releases the socket straight away. Another process may grab the port
//! before the tunnel session binds it; sessions that bind their own socket
//! can report the real port through
//! [`ReadySignal::notify_bound`](crate::session::ReadySignal::notify_bound).

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Source of unused local ports.
///
/// Closures returning `io::Result<u16>` implement this trait, which keeps
/// tests free of real sockets.
pub trait PortFinder: Send + Sync {
    /// Return a port that is free right now. It is not reserved.
    fn find_port(&self) -> io::Result<u16>;
}

impl<F> PortFinder for F
where
    F: Fn() -> io::Result<u16> + Send + Sync,
{
    fn find_port(&self) -> io::Result<u16> {
        self()
    }
}

/// Finds a free port by briefly listening on the loopback interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackPortFinder;

impl PortFinder for LoopbackPortFinder {
    fn find_port(&self) -> io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);

        debug!(port, "found ephemeral port");
        Ok(port)
    }
}
