//! Logging initializer for binaries and tests embedding the harvesters.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the caller.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] ParseError),

    /// A global subscriber is already installed
    #[error("Cannot install subscriber: {0}")]
    Init(String),
}

/// Installs a formatting subscriber filtered by `RUST_LOG`, defaulting to
/// [`DEFAULT_DIRECTIVE`].
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with(DEFAULT_DIRECTIVE)
}

/// Same as [`init_logging`] with an explicit fallback directive.
pub fn init_logging_with(default_directive: &str) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}
