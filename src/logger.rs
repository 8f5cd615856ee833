//! Centralized logging configuration for hybrid-tracker binaries and tests
//!
//! Provides a consistent tracing setup with a default INFO level that can be
//! overridden through the `RUST_LOG` environment variable.

use tracing::Level;

/// Initialize the tracing subscriber with the library's standard configuration.
///
/// Default log level: INFO (overrideable via the `RUST_LOG` environment
/// variable).
///
/// # Example
/// ```no_run
/// hybrid_tracker::logger::init();
/// tracing::info!("tracker ready");
/// ```
pub fn init() {
    init_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via `RUST_LOG`)
pub fn init_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
