//! podlink-core: dial symbolic pod addresses through on-demand tunnels.
//!
//! Provides the readiness gate and forwarder that coordinate a lazily
//! established port-forward tunnel, plus the traits through which tunnel
//! sessions, local port allocation and outbound dials are plugged in.

pub mod address;
pub mod dial;
pub mod error;
pub mod forwarder;
pub mod gate;
pub mod port;
pub mod session;

// Re-export commonly used items at crate root.
pub use address::{split_host_port, RemoteTarget};
pub use dial::{Dialer, TcpDialer};
pub use error::{ForwardError, ForwardResult};
pub use forwarder::Forwarder;
pub use gate::{GateState, ReadinessGate};
pub use port::{LoopbackPortFinder, PortFinder};
pub use session::{PortMapping, ReadySignal, SessionRequest, TunnelSession, TunnelSessionFactory};
