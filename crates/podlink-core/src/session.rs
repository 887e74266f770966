//! Abstract tunnel session traits.
//!
//! The forwarder never knows how a tunnel is built. Implementations (a
//! `kubectl port-forward` child process, an in-process relay, a test fake)
//! satisfy [`TunnelSessionFactory`] and [`TunnelSession`].

use crate::error::ForwardResult;
use futures_util::future::BoxFuture;
use std::fmt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A `local:remote` port pair handed to the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port on `127.0.0.1` the tunnel should listen on.
    pub local: u16,
    /// Port on the remote unit traffic is delivered to.
    pub remote: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Everything a factory needs to know to open a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Scope of the remote unit (namespace).
    pub scope: String,
    /// Name of the remote unit (pod).
    pub name: String,
    /// Ports to forward. The forwarder always sends exactly one.
    pub ports: Vec<PortMapping>,
}

/// One-shot readiness notification handed to a session.
///
/// Consumed on use, so a session can report readiness at most once. Dropping
/// it without notifying means the session never became ready.
#[derive(Debug)]
pub struct ReadySignal {
    tx: oneshot::Sender<Option<u16>>,
}

/// Receiving half of a [`ReadySignal`], held by the forwarder.
pub type ReadyReceiver = oneshot::Receiver<Option<u16>>;

impl ReadySignal {
    /// Create a signal and the receiver the forwarder waits on.
    pub fn new() -> (Self, ReadyReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// The tunnel is listening on the local port it was asked to use.
    pub fn notify(self) {
        let _ = self.tx.send(None);
    }

    /// The tunnel is listening, but on `port` rather than the requested one.
    pub fn notify_bound(self, port: u16) {
        let _ = self.tx.send(Some(port));
    }
}

/// A running tunnel.
pub trait TunnelSession: Send {
    /// Forward traffic until the tunnel ends.
    ///
    /// Must return promptly once the token passed to the factory is cancelled.
    fn forward(self: Box<Self>) -> BoxFuture<'static, ForwardResult<()>>;
}

/// Creates tunnel sessions.
///
/// Plain closures with the same signature implement this trait too.
pub trait TunnelSessionFactory: Send + Sync {
    /// Build a session for `request` without starting it.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Fires when the forwarder stops; the session must end soon after.
    /// * `request` - Target scope, name and port mapping.
    /// * `ready` - Signalled once the local endpoint accepts connections.
    ///
    /// # Errors
    ///
    /// Any error is returned unchanged from [`Forwarder::run`](crate::Forwarder::run)
    /// and reported to every dial.
    fn new_session(
        &self,
        cancel: CancellationToken,
        request: SessionRequest,
        ready: ReadySignal,
    ) -> ForwardResult<Box<dyn TunnelSession>>;
}

impl<F> TunnelSessionFactory for F
where
    F: Fn(CancellationToken, SessionRequest, ReadySignal) -> ForwardResult<Box<dyn TunnelSession>>
        + Send
        + Sync,
{
    fn new_session(
        &self,
        cancel: CancellationToken,
        request: SessionRequest,
        ready: ReadySignal,
    ) -> ForwardResult<Box<dyn TunnelSession>> {
        self(cancel, request, ready)
    }
}
