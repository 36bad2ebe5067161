//! Sets up the global tracing subscriber.

use tracing_subscriber::{EnvFilter, filter::ParseError, fmt, prelude::*};

/// Installs a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_level` if the variable is unset or invalid.
pub fn setup_logging(default_level: &str) -> Result<(), ParseError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}
