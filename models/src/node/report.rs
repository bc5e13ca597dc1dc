//! Install reports published by node-side installers.
//!
//! An installer records its progress on a shim as an annotation on its own `Node` object, keyed by
//! `ShimKey::report_annotation_key`, with the value `<state>@<generation>`. `generation` is the
//! `Shim` generation the installer acted on.

use super::error::{self, Error};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::str::FromStr;

const GENERATION_SEPARATOR: char = '@';

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeShimState {
    /// The shim is installed and configured for its runtime class.
    Installed,
    /// The installer gave up installing the shim.
    Failed,
    /// The shim's resource is being deleted and the installer could not remove it.
    UninstallFailed,
}

serde_plain::derive_display_from_serialize!(NodeShimState);
serde_plain::derive_fromstr_from_deserialize!(NodeShimState);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstallReport {
    pub state: NodeShimState,
    pub generation: i64,
}

impl InstallReport {
    pub fn new(state: NodeShimState, generation: i64) -> Self {
        InstallReport { state, generation }
    }

    /// Whether this report was made against the rollout which began at `source_generation`.
    pub fn is_current(&self, source_generation: i64) -> bool {
        self.generation >= source_generation
    }
}

impl FromStr for InstallReport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (state, generation) = s
            .split_once(GENERATION_SEPARATOR)
            .context(error::MissingGenerationSnafu { report: s })?;
        Ok(InstallReport {
            state: state
                .parse::<NodeShimState>()
                .context(error::ReportStateSnafu { report: s })?,
            generation: generation
                .parse::<i64>()
                .context(error::ReportGenerationSnafu { report: s })?,
        })
    }
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.state, GENERATION_SEPARATOR, self.generation)
    }
}
