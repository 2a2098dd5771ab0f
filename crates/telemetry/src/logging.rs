//! Subscriber formatting presets.

/// Controls how the `tracing_subscriber::fmt` layer renders events.
pub struct LoggingConfig {
    pub json: bool,
    pub file: bool,
    pub line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            file: true,
            line_number: true,
        }
    }
}

impl LoggingConfig {
    /// Human-readable, for local development and test runs.
    pub fn development() -> Self {
        Self::default()
    }

    /// Structured JSON, for anything whose logs get shipped off-host.
    pub fn production() -> Self {
        Self {
            json: true,
            file: true,
            line_number: true,
        }
    }
}
