//! Process logging setup shared by the proxy and control binaries.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The filter directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    /// A global subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global `tracing` subscriber.
pub fn init(filter: &str, format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_new(filter)?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }
    Ok(())
}
