//! One-shot readiness gate.
//!
//! A [`ReadinessGate`] starts out [`GateState::Pending`] and moves exactly once
//! to either [`GateState::Ready`] or [`GateState::Failed`]. The transition is
//! a check-and-set performed under the `watch` channel's lock, so racing
//! resolvers are serialized and only the first one takes effect. Every
//! waiter observes the same final state.

use crate::error::{ForwardError, ForwardResult};
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Observable state of a [`ReadinessGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// Nothing decided yet; waiters block.
    Pending,
    /// The tunnel accepts connections at this local address.
    Ready(SocketAddr),
    /// The tunnel will never become ready.
    Failed(ForwardError),
}

impl GateState {
    /// `true` until the gate has been resolved either way.
    pub fn is_pending(&self) -> bool {
        matches!(self, GateState::Pending)
    }

    fn outcome(&self) -> Option<ForwardResult<SocketAddr>> {
        match self {
            GateState::Pending => None,
            GateState::Ready(addr) => Some(Ok(*addr)),
            GateState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

/// Write-once broadcast of the tunnel's local endpoint.
#[derive(Debug)]
pub struct ReadinessGate {
    state: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create an unresolved gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Pending);
        Self { state }
    }

    /// Resolve the gate as ready. Returns `false` if it was already resolved.
    pub fn resolve_ready(&self, addr: SocketAddr) -> bool {
        self.transition(GateState::Ready(addr))
    }

    /// Resolve the gate as failed. Returns `false` if it was already resolved.
    pub fn resolve_failed(&self, err: ForwardError) -> bool {
        self.transition(GateState::Failed(err))
    }

    fn transition(&self, next: GateState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_pending() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    /// Whether a resolution has happened. Never flips back.
    pub fn is_resolved(&self) -> bool {
        !self.state.borrow().is_pending()
    }

    /// Wait until the gate resolves or `cancel` fires.
    ///
    /// Cancellation wins over a concurrent resolution and yields
    /// [`ForwardError::Cancelled`].
    pub async fn wait(&self, cancel: &CancellationToken) -> ForwardResult<SocketAddr> {
        self.wait_until(cancel, None).await
    }

    /// Like [`wait`](Self::wait), additionally giving up at `deadline` with
    /// [`ForwardError::DeadlineExceeded`].
    pub async fn wait_until(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ForwardResult<SocketAddr> {
        let mut rx = self.state.subscribe();
        let resolved = async {
            // The sender lives as long as `self`, so `wait_for` cannot observe a closed channel.
            let state = rx.wait_for(|state| !state.is_pending()).await;
            state.ok().and_then(|state| state.outcome())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            _ = deadline_elapsed(deadline) => Err(ForwardError::DeadlineExceeded),
            outcome = resolved => {
                outcome.unwrap_or(Err(ForwardError::SessionTerminated))
            }
        }
    }
}

/// Completes at `deadline`, or never when there is none.
pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
