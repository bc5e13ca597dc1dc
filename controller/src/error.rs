use models::shim::{ShimError, ShimKey};

use snafu::Snafu;
use std::time::Duration;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to read or write Shim via kubernetes API: '{}'", source))]
    UpdateShim { source: ShimError },

    #[snafu(display("Shim '{}' has no resource version to condition writes on", key))]
    MissingResourceVersion { key: ShimKey },

    #[snafu(display(
        "Reconciliation of Shim '{}' did not finish within {:?}",
        key,
        timeout
    ))]
    PassTimedOut {
        key: ShimKey,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },

    #[snafu(display("Could not read configuration from '{}': '{}'", variable, message))]
    InvalidConfiguration { variable: String, message: String },
}
