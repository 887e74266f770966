//! CLI subcommand implementations.

pub mod forward;
pub mod parse;
pub mod probe;

use crate::backend;
use crate::config::Settings;
use anyhow::{Context, Result};
use podlink_core::Forwarder;
use std::sync::Arc;

/// Build a forwarder for `addr` using the configured backend.
pub(crate) fn build_forwarder(addr: &str, settings: &Settings) -> Result<Arc<Forwarder>> {
    let factory = backend::build_factory(settings);
    let forwarder = Forwarder::new(settings.network.clone(), addr, factory)
        .with_context(|| format!("cannot forward to '{addr}'"))?;
    Ok(Arc::new(forwarder))
}
