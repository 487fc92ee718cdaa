//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info,vkframe=debug";

/// Installs a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Lines carry their target and thread id. Only the first call installs a
/// subscriber; later calls (and calls after another subscriber was set) do
/// nothing.
///
/// # Example
/// ```
/// vkframe_core::init_logging();
/// tracing::info!("Frame scheduler starting");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
