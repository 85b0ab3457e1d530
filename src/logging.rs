//! Tracing subscriber setup.
//!
//! Log lines go to stderr; stdout is reserved for protocol frames.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Third-party targets kept quiet unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: [(&str, &str); 1] = [("rusqlite", "warn")];

/// Logging setup errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("a global subscriber is already installed: {0}")]
    Install(#[from] TryInitError),
}

/// Builds the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![config.level.clone()];
    directives.extend(
        QUIET_TARGETS
            .iter()
            .map(|(target, level)| format!("{target}={level}")),
    );
    let filter = directives.join(",");
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::Filter {
        message: e.to_string(),
        filter,
    })
}

/// Installs the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;

    let layer = match config.format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()?;
    Ok(())
}
