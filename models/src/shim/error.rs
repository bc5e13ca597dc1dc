use super::ShimKey;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Shim spec has invalid fields: {}", source))]
    InvalidFields { source: validator::ValidationErrors },

    #[snafu(display("Exactly one member of '{}' must be specified", field))]
    MissingVariant { field: String },

    #[snafu(display(
        "maxUnavailable '{}' must be a non-negative integer or a percentage such as '25%'",
        value
    ))]
    InvalidMaxUnavailable { value: String },

    #[snafu(display("Unable to fetch Shim '{}': '{}'", key, source))]
    GetShim { key: ShimKey, source: kube::Error },

    #[snafu(display("Unable to update Shim status '{}': '{}'", key, source))]
    UpdateShimStatus { key: ShimKey, source: kube::Error },

    #[snafu(display("Unable to update Shim finalizers '{}': '{}'", key, source))]
    UpdateShimFinalizers { key: ShimKey, source: kube::Error },

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },
}
