//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; applications embedding the
//! store call [`init_tracing`] once (or install their own subscriber).

use crate::config::MonitoringConfig;
use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Build the event filter: `RUST_LOG` wins over the configured level
pub fn env_filter(config: &MonitoringConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install a global fmt subscriber, JSON when `structured_logging` is set
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &MonitoringConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if config.structured_logging {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| {
        Error::Configuration(format!("Failed to install tracing subscriber: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = MonitoringConfig {
            log_level: "warn".to_string(),
            structured_logging: false,
        };
        // Another test may already have installed a subscriber
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(Error::Configuration(_))));
    }
}
