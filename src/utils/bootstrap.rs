//! Bootstrap utilities for clusterbus binaries.
//!
//! Shared initialization code for binaries embedding a cluster router.

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Event kind attached to fatal startup log lines.
pub const INITIALIZATION_ERROR_EVENT: &str = "PLUGIN_INITIALIZATION_ERROR";

/// Initialize tracing with CLUSTERBUS_LOG environment variable.
///
/// Defaults to "info" level if CLUSTERBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Log an unrecoverable startup error.
///
/// Returns the error so callers can end the process with it.
pub fn fatal<E: std::fmt::Display>(error: E) -> E {
    error!(
        fatal = true,
        event = INITIALIZATION_ERROR_EVENT,
        error = %error,
        "Initialization failed"
    );
    error
}
