//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    // Logs go to stderr so the report table on stdout stays parseable.
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(true));
            subscriber.init();
        }
        (LogFormat::Pretty, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(true).without_time());
            subscriber.init();
        }
        (LogFormat::Json, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.json());
            subscriber.init();
        }
        (LogFormat::Json, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.json().without_time());
            subscriber.init();
        }
        (LogFormat::Compact, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(true));
            subscriber.init();
        }
        (LogFormat::Compact, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(true).without_time());
            subscriber.init();
        }
    }
}
