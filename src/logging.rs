//! Tracing subscriber setup for embedding applications.
//!
//! The engine only emits spans and events; installing a subscriber is left
//! to the host process. This helper covers the common case of a formatted
//! stderr subscriber driven by an env-filter directive.

use crate::error::{EngineError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber with the given default directive, for
/// example `"info"` or `"vanta=debug"`. `RUST_LOG` takes precedence when it
/// is set. Fails if a subscriber is already installed.
pub fn init_logging(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .map_err(|e| EngineError::InvalidArgument(format!("bad log filter {directive:?}: {e}")))?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| EngineError::InvalidArgument("a tracing subscriber is already set".into()))
}
