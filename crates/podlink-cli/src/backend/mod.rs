//! Tunnel session backends.
//!
//! - **[`kubectl`]** spawns `kubectl port-forward` and reports readiness once
//!   the child prints its `Forwarding from` line.
//! - **[`relay`]** binds the local port in-process and relays every accepted
//!   connection straight to an upstream host derived from the pod name and
//!   namespace. Useful from inside a cluster network or against a local
//!   service during development.

pub mod kubectl;
pub mod relay;

use crate::config::{BackendKind, Settings};
use podlink_core::TunnelSessionFactory;
use std::sync::Arc;

pub use kubectl::KubectlSessionFactory;
pub use relay::RelaySessionFactory;

/// Build the session factory selected in `settings`.
pub fn build_factory(settings: &Settings) -> Arc<dyn TunnelSessionFactory> {
    match settings.backend {
        BackendKind::Kubectl => Arc::new(KubectlSessionFactory::new(settings.kubectl.clone())),
        BackendKind::Relay => Arc::new(RelaySessionFactory::new(settings.relay.clone())),
    }
}
