//! The two-phase delete protocol guarding `Shim` resources.
//!
//! A `Shim` carries our finalizer for as long as any node may still have its shim installed. When
//! the resource is deleted, the API server only marks it as terminating; the finalizer is removed,
//! and the object released, once the cleanup agent reports that every node has uninstalled the
//! shim.

use crate::error::{self, Result};

use async_trait::async_trait;
use kube::ResourceExt;
use models::constants;
use models::node::{NodeInventory, NodeShimState};
use models::shim::{Shim, ShimClient, WriteOutcome};
use snafu::{OptionExt, ResultExt};
use tracing::{event, instrument, Level};

/// Where a `Shim` is in its lifecycle, as far as the finalizer is concerned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourcePhase {
    /// Not being deleted, and our finalizer is not yet recorded.
    Unguarded,
    /// Not being deleted; the finalizer is recorded.
    Active,
    /// Deletion requested; the finalizer still holds the object.
    Terminating,
    /// Deletion requested and the finalizer is gone. Nothing is left for us to do.
    Released,
}

impl ResourcePhase {
    pub fn of(shim: &Shim) -> Self {
        match (shim.is_deleting(), shim.has_finalizer()) {
            (false, false) => ResourcePhase::Unguarded,
            (false, true) => ResourcePhase::Active,
            (true, true) => ResourcePhase::Terminating,
            (true, false) => ResourcePhase::Released,
        }
    }
}

/// The cleanup agent's view of a shim's removal from the cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CleanupStatus {
    Done,
    Pending(String),
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Removes a shim from every node. Requests must be idempotent: the controller asks again on every
/// pass until the agent reports `Done`.
pub trait CleanupAgent: Send + Sync {
    async fn request_cleanup(&self, shim: &Shim) -> CleanupStatus;
}

/// A `CleanupAgent` relying on node-side installers.
///
/// The deletion timestamp on the `Shim` is itself the uninstall request. Installers remove their
/// report annotation once the shim is gone from their node, or mark it `uninstall-failed`.
pub struct NodeAnnotationCleanupAgent<I: NodeInventory> {
    inventory: I,
}

impl<I: NodeInventory> NodeAnnotationCleanupAgent<I> {
    pub fn new(inventory: I) -> Self {
        NodeAnnotationCleanupAgent { inventory }
    }
}

#[async_trait]
impl<I: NodeInventory> CleanupAgent for NodeAnnotationCleanupAgent<I> {
    async fn request_cleanup(&self, shim: &Shim) -> CleanupStatus {
        let key = shim.key();
        let annotation = key.report_annotation_key();

        let mut pending = Vec::new();
        let mut failed = Vec::new();
        for node in self.inventory.list_nodes() {
            if !node.annotations.contains_key(&annotation) {
                continue;
            }
            match node.install_report(&key) {
                Some(report) if report.state == NodeShimState::UninstallFailed => {
                    failed.push(node.name)
                }
                _ => pending.push(node.name),
            }
        }
        failed.sort();
        pending.sort();

        if !failed.is_empty() {
            CleanupStatus::Failed(format!(
                "uninstall failed on nodes: {}",
                failed.join(", ")
            ))
        } else if !pending.is_empty() {
            CleanupStatus::Pending(format!(
                "waiting for nodes to uninstall: {}",
                pending.join(", ")
            ))
        } else {
            CleanupStatus::Done
        }
    }
}

/// Outcome of driving a terminating `Shim` towards release.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Cleanup finished and the finalizer removal was attempted with the given result.
    Released(WriteOutcome),
    Pending(String),
    Failed(String),
}

/// Sequences the finalizer handshake. Never removes the finalizer before cleanup is done.
pub struct FinalizerLifecycle<C: ShimClient, A: CleanupAgent> {
    client: C,
    cleanup: A,
}

impl<C: ShimClient, A: CleanupAgent> FinalizerLifecycle<C, A> {
    pub fn new(client: C, cleanup: A) -> Self {
        FinalizerLifecycle { client, cleanup }
    }

    /// Records our finalizer on the `Shim` if it is missing. Returns `None` when nothing needed
    /// writing, otherwise the outcome of the conditional write.
    #[instrument(skip(self, shim), fields(shim = %shim.key()), err)]
    pub async fn ensure_present(&self, shim: &Shim) -> Result<Option<WriteOutcome>> {
        if shim.has_finalizer() {
            return Ok(None);
        }
        let mut finalizers = shim.finalizers().to_vec();
        finalizers.push(constants::SHIM_FINALIZER.to_string());

        let outcome = self.write_finalizers(shim, &finalizers).await?;
        event!(Level::INFO, ?outcome, "Added finalizer to Shim.");
        Ok(Some(outcome))
    }

    /// Asks the cleanup agent to remove the shim from every node and, once it has, removes our
    /// finalizer so the API server can delete the object.
    #[instrument(skip(self, shim), fields(shim = %shim.key()), err)]
    pub async fn ensure_cleaned_up_and_removed(&self, shim: &Shim) -> Result<Termination> {
        match self.cleanup.request_cleanup(shim).await {
            CleanupStatus::Done => {
                let finalizers: Vec<String> = shim
                    .finalizers()
                    .iter()
                    .filter(|finalizer| *finalizer != constants::SHIM_FINALIZER)
                    .cloned()
                    .collect();
                let outcome = self.write_finalizers(shim, &finalizers).await?;
                event!(Level::INFO, ?outcome, "Cleanup done, removed finalizer from Shim.");
                Ok(Termination::Released(outcome))
            }
            CleanupStatus::Pending(reason) => {
                event!(Level::DEBUG, %reason, "Cleanup still in progress.");
                Ok(Termination::Pending(reason))
            }
            CleanupStatus::Failed(reason) => {
                event!(Level::WARN, %reason, "Cleanup failed.");
                Ok(Termination::Failed(reason))
            }
        }
    }

    async fn write_finalizers(&self, shim: &Shim, finalizers: &[String]) -> Result<WriteOutcome> {
        let key = shim.key();
        let version = shim
            .resource_version()
            .context(error::MissingResourceVersionSnafu { key: key.clone() })?;
        self.client
            .update_shim_finalizers(&key, finalizers, &version)
            .await
            .context(error::UpdateShimSnafu)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use mockall::predicate;
    use models::node::{InstallReport, NodeInfo};
    use models::shim::{MockShimClient, ShimKey, ShimSpec};

    pub(crate) fn shim_with(finalizers: &[&str], deleting: bool) -> Shim {
        let mut shim = Shim::new("spin", ShimSpec::default());
        shim.metadata = ObjectMeta {
            name: Some("spin".to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("100".to_string()),
            generation: Some(1),
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            deletion_timestamp: deleting.then(|| Time(Utc::now())),
            ..Default::default()
        };
        shim
    }

    #[test]
    fn test_resource_phase() {
        let test_cases = vec![
            (vec![], false, ResourcePhase::Unguarded),
            (vec!["other"], false, ResourcePhase::Unguarded),
            (vec![constants::SHIM_FINALIZER], false, ResourcePhase::Active),
            (vec![constants::SHIM_FINALIZER], true, ResourcePhase::Terminating),
            (vec!["other"], true, ResourcePhase::Released),
        ];
        for (finalizers, deleting, expected) in test_cases {
            assert_eq!(
                ResourcePhase::of(&shim_with(&finalizers, deleting)),
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_ensure_present_adds_finalizer() {
        let mut client = MockShimClient::new();
        client
            .expect_update_shim_finalizers()
            .with(
                predicate::eq(ShimKey::new("default", "spin")),
                predicate::eq(vec![
                    "other".to_string(),
                    constants::SHIM_FINALIZER.to_string(),
                ]),
                predicate::eq("100"),
            )
            .returning(|_, _, _| Ok(WriteOutcome::Applied))
            .times(1);
        let lifecycle = FinalizerLifecycle::new(client, MockCleanupAgent::new());

        let outcome = lifecycle
            .ensure_present(&shim_with(&["other"], false))
            .await
            .unwrap();
        assert_eq!(outcome, Some(WriteOutcome::Applied));
    }

    #[tokio::test]
    async fn test_ensure_present_is_noop_when_recorded() {
        let mut client = MockShimClient::new();
        client.expect_update_shim_finalizers().times(0);
        let lifecycle = FinalizerLifecycle::new(client, MockCleanupAgent::new());

        let outcome = lifecycle
            .ensure_present(&shim_with(&[constants::SHIM_FINALIZER], false))
            .await
            .unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_finalizer_kept_while_cleanup_pending() {
        let mut client = MockShimClient::new();
        client.expect_update_shim_finalizers().times(0);
        let mut cleanup = MockCleanupAgent::new();
        cleanup
            .expect_request_cleanup()
            .returning(|_| CleanupStatus::Pending("waiting".to_string()));
        let lifecycle = FinalizerLifecycle::new(client, cleanup);

        let outcome = lifecycle
            .ensure_cleaned_up_and_removed(&shim_with(&[constants::SHIM_FINALIZER], true))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Pending("waiting".to_string()));
    }

    #[tokio::test]
    async fn test_finalizer_kept_when_cleanup_fails() {
        let mut client = MockShimClient::new();
        client.expect_update_shim_finalizers().times(0);
        let mut cleanup = MockCleanupAgent::new();
        cleanup
            .expect_request_cleanup()
            .returning(|_| CleanupStatus::Failed("boom".to_string()));
        let lifecycle = FinalizerLifecycle::new(client, cleanup);

        let outcome = lifecycle
            .ensure_cleaned_up_and_removed(&shim_with(&[constants::SHIM_FINALIZER], true))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_finalizer_removed_once_cleanup_done() {
        let mut client = MockShimClient::new();
        client
            .expect_update_shim_finalizers()
            .with(
                predicate::always(),
                predicate::eq(vec!["other".to_string()]),
                predicate::eq("100"),
            )
            .returning(|_, _, _| Ok(WriteOutcome::Applied))
            .times(1);
        let mut cleanup = MockCleanupAgent::new();
        cleanup
            .expect_request_cleanup()
            .returning(|_| CleanupStatus::Done);
        let lifecycle = FinalizerLifecycle::new(client, cleanup);

        let outcome = lifecycle
            .ensure_cleaned_up_and_removed(&shim_with(&["other", constants::SHIM_FINALIZER], true))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Released(WriteOutcome::Applied));
    }

    #[tokio::test]
    async fn test_node_annotation_cleanup_agent() {
        let shim = shim_with(&[constants::SHIM_FINALIZER], true);
        let annotation = shim.key().report_annotation_key();

        let agent = NodeAnnotationCleanupAgent::new(vec![
            NodeInfo::new("a", "a-uid"),
            NodeInfo::new("b", "b-uid").with_annotation(annotation.clone(), "installed@1"),
        ]);
        assert_eq!(
            agent.request_cleanup(&shim).await,
            CleanupStatus::Pending("waiting for nodes to uninstall: b".to_string())
        );

        let agent = NodeAnnotationCleanupAgent::new(vec![
            NodeInfo::new("b", "b-uid").with_annotation(annotation.clone(), "installed@1"),
            NodeInfo::new("c", "c-uid").with_annotation(
                annotation,
                InstallReport::new(NodeShimState::UninstallFailed, 1).to_string(),
            ),
        ]);
        assert_eq!(
            agent.request_cleanup(&shim).await,
            CleanupStatus::Failed("uninstall failed on nodes: c".to_string())
        );

        let agent = NodeAnnotationCleanupAgent::new(vec![NodeInfo::new("a", "a-uid")]);
        assert_eq!(agent.request_cleanup(&shim).await, CleanupStatus::Done);
    }
}
