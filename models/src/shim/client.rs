use super::error::{self, Result};
use super::{NodeReference, Shim, ShimKey, ShimSource, ShimStatus, K8S_SHIM_KIND};
use crate::constants;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use serde::Serialize;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

const HTTP_CONFLICT: u16 = 409;
const HTTP_NOT_FOUND: u16 = 404;

/// Result of a conditional write against the resource store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Applied,
    /// The object changed since it was read; the caller must start over from a fresh read.
    Conflict,
    NotFound,
}

#[async_trait]
/// A trait providing an interface to read and conditionally write `Shim` objects. This is provided
/// as a trait in order to allow mocks to be used for testing purposes.
pub trait ShimClient: Clone + Sized + Send + Sync {
    /// Fetches the current `Shim`, or `None` if it no longer exists.
    async fn get_shim(&self, key: &ShimKey) -> Result<Option<Shim>>;
    /// Overwrites the `.status` of a `Shim`, provided it is still at `expected_version`.
    async fn update_shim_status(
        &self,
        key: &ShimKey,
        status: &ShimStatus,
        expected_version: &str,
    ) -> Result<WriteOutcome>;
    /// Overwrites the finalizers of a `Shim`, provided it is still at `expected_version`.
    async fn update_shim_finalizers(
        &self,
        key: &ShimKey,
        finalizers: &[String],
        expected_version: &str,
    ) -> Result<WriteOutcome>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ShimClient for use in tests.
    pub ShimClient {}
    #[async_trait]
    impl ShimClient for ShimClient {
        async fn get_shim(&self, key: &ShimKey) -> Result<Option<Shim>>;
        async fn update_shim_status(
            &self,
            key: &ShimKey,
            status: &ShimStatus,
            expected_version: &str,
        ) -> Result<WriteOutcome>;
        async fn update_shim_finalizers(
            &self,
            key: &ShimKey,
            finalizers: &[String],
            expected_version: &str,
        ) -> Result<WriteOutcome>;
    }

    impl Clone for ShimClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ShimClient for Arc<T>
where
    T: ShimClient,
{
    async fn get_shim(&self, key: &ShimKey) -> Result<Option<Shim>> {
        (**self).get_shim(key).await
    }

    async fn update_shim_status(
        &self,
        key: &ShimKey,
        status: &ShimStatus,
        expected_version: &str,
    ) -> Result<WriteOutcome> {
        (**self)
            .update_shim_status(key, status, expected_version)
            .await
    }

    async fn update_shim_finalizers(
        &self,
        key: &ShimKey,
        finalizers: &[String],
        expected_version: &str,
    ) -> Result<WriteOutcome> {
        (**self)
            .update_shim_finalizers(key, finalizers, expected_version)
            .await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ShimClient` trait backed by the Kubernetes API.
pub struct K8SShimClient {
    k8s_client: kube::client::Client,
}

impl K8SShimClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SShimClient { k8s_client }
    }

    fn api(&self, key: &ShimKey) -> Api<Shim> {
        Api::namespaced(self.k8s_client.clone(), &key.namespace)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
/// Carries the resource version the write is conditional on. The API server rejects a patch
/// whose `resourceVersion` no longer matches with a conflict.
struct PreconditionMetadata<'a> {
    resource_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    finalizers: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
/// Every status field, serialized even when empty so that a merge patch clears what the new
/// status no longer holds.
struct ShimStatusOverwrite<'a> {
    observed_generation: i64,
    conditions: &'a [Condition],
    observed_source: Option<&'a ShimSource>,
    source_generation: i64,
    upgraded_nodes: &'a [NodeReference],
    upgrading_nodes: &'a [NodeReference],
    queued_nodes: &'a [NodeReference],
}

impl<'a> From<&'a ShimStatus> for ShimStatusOverwrite<'a> {
    fn from(status: &'a ShimStatus) -> Self {
        ShimStatusOverwrite {
            observed_generation: status.observed_generation,
            conditions: &status.conditions,
            observed_source: status.observed_source.as_ref(),
            source_generation: status.source_generation,
            upgraded_nodes: &status.upgraded_nodes,
            upgrading_nodes: &status.upgrading_nodes,
            queued_nodes: &status.queued_nodes,
        }
    }
}

#[derive(Debug, Serialize)]
/// A helper struct used to serialize and send conditional patches to the k8s API.
struct ShimPatch<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: PreconditionMetadata<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ShimStatusOverwrite<'a>>,
}

/// Maps the API server's optimistic-concurrency and not-found responses onto `WriteOutcome`.
fn write_outcome(result: kube::Result<Shim>) -> kube::Result<WriteOutcome> {
    match result {
        Ok(_) => Ok(WriteOutcome::Applied),
        Err(kube::Error::Api(response)) if response.code == HTTP_CONFLICT => {
            Ok(WriteOutcome::Conflict)
        }
        Err(kube::Error::Api(response)) if response.code == HTTP_NOT_FOUND => {
            Ok(WriteOutcome::NotFound)
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ShimClient for K8SShimClient {
    #[instrument(skip(self), err)]
    async fn get_shim(&self, key: &ShimKey) -> Result<Option<Shim>> {
        self.api(key)
            .get_opt(&key.name)
            .await
            .context(error::GetShimSnafu { key: key.clone() })
    }

    #[instrument(skip(self, status), err)]
    async fn update_shim_status(
        &self,
        key: &ShimKey,
        status: &ShimStatus,
        expected_version: &str,
    ) -> Result<WriteOutcome> {
        let patch = ShimPatch {
            api_version: constants::API_VERSION,
            kind: K8S_SHIM_KIND,
            metadata: PreconditionMetadata {
                resource_version: expected_version,
                finalizers: None,
            },
            status: Some(status.into()),
        };
        let patch = serde_json::to_value(patch).context(error::CreateK8SPatchSnafu)?;

        let outcome = write_outcome(
            self.api(key)
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )
        .context(error::UpdateShimStatusSnafu { key: key.clone() })?;

        event!(Level::DEBUG, ?outcome, "Conditional status write finished.");
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn update_shim_finalizers(
        &self,
        key: &ShimKey,
        finalizers: &[String],
        expected_version: &str,
    ) -> Result<WriteOutcome> {
        let patch = ShimPatch {
            api_version: constants::API_VERSION,
            kind: K8S_SHIM_KIND,
            metadata: PreconditionMetadata {
                resource_version: expected_version,
                finalizers: Some(finalizers),
            },
            status: None,
        };
        let patch = serde_json::to_value(patch).context(error::CreateK8SPatchSnafu)?;

        let outcome = write_outcome(
            self.api(key)
                .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )
        .context(error::UpdateShimFinalizersSnafu { key: key.clone() })?;

        event!(Level::DEBUG, ?outcome, "Conditional finalizer write finished.");
        Ok(outcome)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shim::ShimSpec;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("shims.runtime.k8s.containerd.io \"spin\": {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_write_outcome() {
        assert_eq!(
            write_outcome(Ok(Shim::new("spin", ShimSpec::default()))).unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(
            write_outcome(Err(api_error(409, "Conflict"))).unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            write_outcome(Err(api_error(404, "NotFound"))).unwrap(),
            WriteOutcome::NotFound
        );

        let err = write_outcome(Err(api_error(500, "InternalError"))).unwrap_err();
        assert!(matches!(err, kube::Error::Api(response) if response.code == 500));
    }

    #[test]
    fn test_status_patch_clears_empty_fields() {
        let status = ShimStatus {
            upgraded_nodes: vec![NodeReference::new("node-a", "uid-a")],
            ..Default::default()
        };
        let patch = ShimPatch {
            api_version: constants::API_VERSION,
            kind: K8S_SHIM_KIND,
            metadata: PreconditionMetadata {
                resource_version: "42",
                finalizers: None,
            },
            status: Some((&status).into()),
        };
        let value = serde_json::to_value(patch).unwrap();

        assert_eq!(value["metadata"]["resourceVersion"], "42");
        assert!(value["metadata"].get("finalizers").is_none());
        assert_eq!(value["status"]["upgradedNodes"][0]["uid"], "uid-a");
        assert_eq!(value["status"]["queuedNodes"], serde_json::json!([]));
        assert!(value["status"]["observedSource"].is_null());
    }

    #[test]
    fn test_finalizer_patch() {
        let finalizers = vec![constants::SHIM_FINALIZER.to_string()];
        let patch = ShimPatch {
            api_version: constants::API_VERSION,
            kind: K8S_SHIM_KIND,
            metadata: PreconditionMetadata {
                resource_version: "7",
                finalizers: Some(&finalizers),
            },
            status: None,
        };
        let value = serde_json::to_value(patch).unwrap();

        assert_eq!(value["apiVersion"], "runtime.k8s.containerd.io/v1alpha1");
        assert_eq!(
            value["metadata"]["finalizers"][0],
            "shim.runtime.k8s.containerd.io/finalizer"
        );
        assert!(value.get("status").is_none());
    }
}
