use thiserror::Error;

/// Errors produced while establishing or using a redirected tunnel.
///
/// Cloneable so that a single failure recorded in the readiness gate can be
/// handed to every waiting dialer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// The address is not `{name}.{scope}...`, or lacks a usable port.
    #[error("unsupported address format: {0}")]
    InvalidAddress(String),

    /// No free local port could be found for the tunnel endpoint.
    #[error("failed to allocate local port: {0}")]
    PortAllocation(String),

    /// The session factory refused or failed to build a session.
    #[error("failed to create tunnel session: {0}")]
    SessionCreation(String),

    /// A running session ended with an error. Returned from
    /// [`Forwarder::run`](crate::Forwarder::run) only; dials see
    /// [`SessionTerminated`](Self::SessionTerminated) instead.
    #[error("tunnel session failed: {0}")]
    Session(String),

    /// The tunnel has ended; the forwarder will never redirect again.
    #[error("not currently forwarding")]
    SessionTerminated,

    /// The caller's [`CancellationToken`](tokio_util::sync::CancellationToken) fired.
    #[error("context canceled")]
    Cancelled,

    /// The caller's deadline elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Connecting to the local tunnel endpoint failed.
    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("forwarder is already running")]
    AlreadyRunning,
}

impl ForwardError {
    /// Whether this error came from the caller's own cancellation or deadline.
    pub fn is_context_error(&self) -> bool {
        matches!(self, ForwardError::Cancelled | ForwardError::DeadlineExceeded)
    }
}

/// Result alias used throughout podlink-core.
pub type ForwardResult<T> = Result<T, ForwardError>;
