//! Symbolic address parsing.
//!
//! Pod addresses look like `{name}.{scope}.pod.cluster.local:{port}`. Only
//! the first two dot-separated host components are meaningful; everything
//! after the scope is ignored.

use crate::error::{ForwardError, ForwardResult};

/// Remote compute unit identified by a symbolic address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Unit name, e.g. the pod name.
    pub name: String,
    /// Scope the unit lives in, e.g. the namespace.
    pub scope: String,
}

impl RemoteTarget {
    /// Parse the name and scope out of `addr`.
    ///
    /// `addr` may carry a `:port` suffix, which is stripped first. The host
    /// must contain at least two non-empty `.`-separated components.
    ///
    /// # Arguments
    ///
    /// * `addr` - A symbolic address such as `web-0.default.pod.cluster.local:8080`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::InvalidAddress`] when the name or scope is
    /// missing or empty.
    pub fn parse(addr: &str) -> ForwardResult<Self> {
        let host = match split_host_port(addr) {
            Ok((host, _)) => host,
            Err(_) => addr,
        };

        let mut parts = host.splitn(3, '.');
        let name = parts.next().unwrap_or_default();
        let scope = parts.next().unwrap_or_default();

        if name.is_empty() || scope.is_empty() {
            return Err(ForwardError::InvalidAddress(addr.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            scope: scope.to_string(),
        })
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// Split `host:port` into its host and numeric port.
///
/// Bracketed IPv6 literals (`[::1]:80`) are accepted.
///
/// # Errors
///
/// Returns [`ForwardError::InvalidAddress`] when there is no port, the port
/// is not a `u16`, or an IPv6 host is not bracketed.
pub fn split_host_port(addr: &str) -> ForwardResult<(&str, u16)> {
    let invalid = || ForwardError::InvalidAddress(format!("missing port in address {addr}"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| ForwardError::InvalidAddress(format!("invalid port in address {addr}")))?;

    Ok((host, port))
}
