//! Structured logging infrastructure for CareChain.
//!
//! Operator alerts (permanent anchoring failures) are emitted on the
//! [`ALERT_TARGET`] target so they can be routed separately, e.g.
//! `RUST_LOG=info,carechain::alert=error`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target for operator-visible alerts
pub const ALERT_TARGET: &str = "carechain::alert";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging system with human-readable output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use carechain_core::logging;
///
/// logging::init();
/// tracing::info!("Anchoring service started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// # Example
/// ```no_run
/// use carechain_core::logging;
///
/// logging::init_json();
/// tracing::info!(service = "anchor-node", "Service started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Like [`init`] but tolerates an already-installed subscriber (tests, embedding).
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
