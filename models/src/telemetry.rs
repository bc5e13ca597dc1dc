//! Project-wide utility for initializing tracing.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "SHIM_TRACING_FILTER";
const LOGGING_FORMATTER_ENV_VAR: &str = "SHIM_LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "SHIM_LOGGING_ANSI_ENABLED";

pub use error::TelemetryConfigError;

type Result<T> = std::result::Result<T, error::TelemetryConfigError>;

/// How tracing events are rendered: the message format plus whether ANSI colors are emitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    message_format: MessageFormat,
    ansi_enabled: bool,
}

impl LogFormatter {
    pub fn try_from_env() -> Result<Self> {
        Self::from_values(
            env::var(LOGGING_FORMATTER_ENV_VAR).ok(),
            env::var(LOGGING_ANSI_ENABLED_ENV_VAR).ok(),
        )
    }

    fn from_values(format: Option<String>, ansi_enabled: Option<String>) -> Result<Self> {
        let message_format = format
            .map(|format| {
                serde_plain::from_str::<MessageFormat>(&format)
                    .context(error::LogFormatterEnvSnafu { env_value: format })
            })
            .transpose()?
            .unwrap_or_default();

        let ansi_enabled = ansi_enabled
            .map(|ansi| {
                ansi.to_lowercase()
                    .parse::<bool>()
                    .context(error::LogAnsiEnvSnafu { env_value: ansi })
            })
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            message_format,
            ansi_enabled,
        })
    }

    /// Adds a formatting layer to a tracing event subscriber.
    fn add_format_layer<S>(&self, event_subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each format produces a distinct layer type, so the subscriber is boxed per arm.
        match self.message_format {
            MessageFormat::Full => {
                Box::new(event_subscriber.with(fmt::layer().with_ansi(self.ansi_enabled)))
            }
            MessageFormat::Compact => {
                Box::new(event_subscriber.with(fmt::layer().compact().with_ansi(self.ansi_enabled)))
            }
            MessageFormat::Pretty => {
                Box::new(event_subscriber.with(fmt::layer().pretty().with_ansi(self.ansi_enabled)))
            }
            MessageFormat::Json => {
                Box::new(event_subscriber.with(fmt::layer().json().with_ansi(self.ansi_enabled)))
            }
        }
    }
}

/// The message format for logging tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    #[default]
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs, suited to log aggregation in-cluster.
    Json,
}

pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LogFormatter::try_from_env()?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use super::*;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_log_formatter_defaults() {
        let formatter = LogFormatter::from_values(None, None).unwrap();
        assert_eq!(formatter, LogFormatter::default());
    }

    #[test]
    fn test_log_formatter_parses_values() {
        let formatter =
            LogFormatter::from_values(Some("json".to_string()), Some("TRUE".to_string())).unwrap();
        assert_eq!(formatter.message_format, MessageFormat::Json);
        assert!(formatter.ansi_enabled);
    }

    #[test]
    fn test_log_formatter_rejects_bad_values() {
        assert!(LogFormatter::from_values(Some("yaml".to_string()), None).is_err());
        assert!(LogFormatter::from_values(None, Some("maybe".to_string())).is_err());
    }
}
