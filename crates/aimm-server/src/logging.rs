//! Logging setup over `tracing`.

use tracing_subscriber::{EnvFilter, fmt};

/// Builder for the process-wide tracing subscriber.
///
/// The `AIMM_LOG` environment variable overrides the configured level with a
/// full filter directive.
pub struct LoggingBuilder {
    level: String,
    writer_stderr: bool,
}

impl LoggingBuilder {
    /// Creates a builder with the default `info` level.
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            writer_stderr: false,
        }
    }

    /// Sets the default level (`trace` … `error`).
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Routes log output to stderr instead of stdout. Worker processes must
    /// use this: their stdout carries result frames.
    pub fn with_stderr(mut self) -> Self {
        self.writer_stderr = true;
        self
    }

    /// Installs the global subscriber. Later calls are ignored.
    pub fn init(self) {
        let filter = EnvFilter::try_from_env("AIMM_LOG")
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));
        let builder = fmt().with_env_filter(filter);
        let result = if self.writer_stderr {
            builder.with_writer(std::io::stderr).try_init()
        } else {
            builder.try_init()
        };
        if result.is_err() {
            tracing::debug!("logging already initialized");
        }
    }
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}
