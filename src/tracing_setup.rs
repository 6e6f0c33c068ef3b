//! Tracing subscriber initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=daq_actions=trace` works without touching the config file.

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{EngineError, EngineResult};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if set and valid, otherwise the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber described by `config`.
///
/// Fails if a global subscriber is already installed.
pub fn init_from_config(config: &ApplicationConfig) -> EngineResult<()> {
    let filter = env_filter(&config.log_level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.log_format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    result.map_err(|e| EngineError::Tracing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_second_init_fails() {
        let config = ApplicationConfig::default();
        // Another test may already own the global subscriber.
        let _ = init_from_config(&config);
        assert!(matches!(
            init_from_config(&config),
            Err(EngineError::Tracing(_))
        ));
    }

    #[test]
    #[serial]
    fn test_filter_uses_configured_level() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter("warn");
        assert_eq!(filter.to_string(), "warn");
    }
}
