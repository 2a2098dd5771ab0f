//! Subscriber initialisation for the shm-utils crate family.
//!
//! The core crate logs exclusively through the `tracing` facade; this
//! crate is the one place that wires a concrete subscriber to stdout, so
//! binaries and tests get consistent formatting without each reaching for
//! `tracing_subscriber` directly.

pub mod logging;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use logging::LoggingConfig;

/// Initialize with `INFO` as the default level (overridable via `RUST_LOG`).
pub fn init() {
    init_with(Level::INFO, LoggingConfig::development());
}

/// Initialize with a specific default level (overridable via `RUST_LOG`).
pub fn init_with_level(level: Level) {
    init_with(level, LoggingConfig::development());
}

/// Initialize with an explicit level and formatting preset.
pub fn init_with(level: Level, config: LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(config.file)
        .with_line_number(config.line_number);

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }

    tracing::debug!("telemetry subscriber initialized");
}
