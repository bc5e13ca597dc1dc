use crate::error::{self, Result};

use std::env;
use std::str::FromStr;
use std::time::Duration;

const WATCH_NAMESPACE_ENV_VAR: &str = "SHIM_WATCH_NAMESPACE";
const UPGRADE_POLL_ENV_VAR: &str = "SHIM_UPGRADE_POLL_SECONDS";
const CLEANUP_POLL_ENV_VAR: &str = "SHIM_CLEANUP_POLL_SECONDS";
const PASS_TIMEOUT_ENV_VAR: &str = "SHIM_PASS_TIMEOUT_SECONDS";
const METRICS_PORT_ENV_VAR: &str = "SHIM_METRICS_PORT";

const DEFAULT_UPGRADE_POLL: Duration = Duration::from_secs(10);
const DEFAULT_CLEANUP_POLL: Duration = Duration::from_secs(15);
const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_METRICS_PORT: u16 = 8080;

/// How often a reconciled `Shim` is looked at again when no watch event arrives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PollIntervals {
    /// While nodes are upgrading, to pick up installer reports.
    pub upgrade: Duration,
    /// While a terminating `Shim` waits for nodes to uninstall it.
    pub cleanup: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        PollIntervals {
            upgrade: DEFAULT_UPGRADE_POLL,
            cleanup: DEFAULT_CLEANUP_POLL,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerConfig {
    /// Only `Shim`s in this namespace are reconciled. `None` watches every namespace.
    pub watch_namespace: Option<String>,
    pub poll_intervals: PollIntervals,
    /// Upper bound on a single reconciliation pass.
    pub pass_timeout: Duration,
    pub metrics_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            watch_namespace: None,
            poll_intervals: PollIntervals::default(),
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl ControllerConfig {
    pub fn from_environment() -> Result<Self> {
        Self::from_lookup(|variable| env::var(variable).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ControllerConfig::default();
        Ok(ControllerConfig {
            watch_namespace: lookup(WATCH_NAMESPACE_ENV_VAR).filter(|ns| !ns.is_empty()),
            poll_intervals: PollIntervals {
                upgrade: seconds(&lookup, UPGRADE_POLL_ENV_VAR)?
                    .unwrap_or(defaults.poll_intervals.upgrade),
                cleanup: seconds(&lookup, CLEANUP_POLL_ENV_VAR)?
                    .unwrap_or(defaults.poll_intervals.cleanup),
            },
            pass_timeout: seconds(&lookup, PASS_TIMEOUT_ENV_VAR)?.unwrap_or(defaults.pass_timeout),
            metrics_port: parsed(&lookup, METRICS_PORT_ENV_VAR)?.unwrap_or(defaults.metrics_port),
        })
    }
}

fn parsed<F, T>(lookup: &F, variable: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(variable)
        .map(|value| {
            value.parse::<T>().map_err(|err| {
                error::InvalidConfigurationSnafu {
                    variable,
                    message: format!("'{}': {}", value, err),
                }
                .build()
            })
        })
        .transpose()
}

fn seconds<F>(lookup: &F, variable: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match parsed::<F, u64>(lookup, variable)? {
        Some(0) => error::InvalidConfigurationSnafu {
            variable,
            message: "must be at least one second",
        }
        .fail(),
        other => Ok(other.map(Duration::from_secs)),
    }
}
