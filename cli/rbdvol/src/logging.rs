//! Logging initialization.
//!
//! Logs go to stderr so that stdout carries only command output.

use std::io;

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Single-line human-readable events.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(io::stderr))
            .init(),
    }
}
