//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LogFormat;
use crate::error::CsiError;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,libnvmf=debug";

/// Install the global subscriber.  Fails if one is already installed.
pub fn init(format: LogFormat) -> Result<(), CsiError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| CsiError::Internal(format!("install tracing subscriber: {e}")))
}

/// Best-effort subscriber for tests; later calls are no-ops.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
