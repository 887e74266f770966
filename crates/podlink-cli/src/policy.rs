//! Proxy policy: which scopes may be forwarded and how many redirected
//! connections may be open at once.
//!
//! - [`ProxyPolicy`] is the plain configuration.
//! - [`ProxyPolicyEnforcer`] owns the policy plus an atomic connection
//!   counter and performs the checks.

use podlink_core::RemoteTarget;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static proxy access-control configuration.
///
/// `allowed_scopes` matches the target's scope exactly; `"*"` allows every
/// scope and an empty list allows none.
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    /// Scopes that may be forwarded. Empty = allow none. `["*"]` = allow all.
    pub allowed_scopes: Vec<String>,
    /// Maximum number of concurrently redirected connections.
    pub max_connections: usize,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            allowed_scopes: vec!["*".to_string()],
            max_connections: 100,
        }
    }
}

/// Runtime policy enforcer with atomic connection tracking.
pub struct ProxyPolicyEnforcer {
    /// The underlying static rules.
    policy: ProxyPolicy,
    /// Connections currently being redirected, shared with every guard.
    active_connections: Arc<AtomicUsize>,
    /// `allowed_scopes` as a set for lookups.
    allowed_set: HashSet<String>,
    /// `true` when `"*"` is listed.
    allow_all: bool,
}

impl ProxyPolicyEnforcer {
    /// Create an enforcer from `policy`.
    pub fn new(policy: ProxyPolicy) -> Self {
        let allow_all = policy.allowed_scopes.iter().any(|s| s == "*");
        let allowed_set = policy.allowed_scopes.iter().cloned().collect();
        Self {
            policy,
            active_connections: Arc::new(AtomicUsize::new(0)),
            allowed_set,
            allow_all,
        }
    }

    /// Check whether `target` may be forwarded at all.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the target's scope is not allowed.
    pub fn check_target(&self, target: &RemoteTarget) -> Result<(), String> {
        if self.allow_all || self.allowed_set.contains(&target.scope) {
            return Ok(());
        }
        Err(format!("scope not allowed: {}", target.scope))
    }

    /// Check whether another connection may be redirected.
    pub fn check_connect(&self) -> Result<(), String> {
        let current = self.active_connections.load(Ordering::Relaxed);
        if current >= self.policy.max_connections {
            return Err(format!(
                "connection limit reached ({}/{})",
                current, self.policy.max_connections
            ));
        }
        Ok(())
    }

    /// Increment the active connection count. The returned guard decrements
    /// it on drop and can be moved into the connection's task.
    pub fn acquire(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    /// Approximate number of open redirected connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the connection count on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
