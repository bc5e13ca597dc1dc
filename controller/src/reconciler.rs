use crate::classifier;
use crate::config::PollIntervals;
use crate::error::{self, Result};
use crate::finalizer::{CleanupAgent, FinalizerLifecycle, ResourcePhase, Termination};
use crate::planner::{self, CompletionSignals};
use crate::selector;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use models::constants::{
    CONDITION_NODE_INSTALL_FAILED, CONDITION_ROLLOUT_COMPLETE, CONDITION_TERMINATING,
    CONDITION_VALID, REASON_ALL_NODES_UPGRADED, REASON_CLEANUP_FAILED, REASON_CLEANUP_PENDING,
    REASON_INSTALLER_REPORTED_FAILURE, REASON_INVALID_SPEC, REASON_NO_FAILURES,
    REASON_ROLLOUT_IN_PROGRESS, REASON_SOURCE_CHANGED, REASON_SPEC_VALID,
};
use models::node::{NodeInfo, NodeInventory};
use models::shim::conditions::{set_condition, StatusCondition};
use models::shim::{
    NodeReference, RolloutStrategy, Shim, ShimClient, ShimKey, ShimStatus, WriteOutcome,
};
use snafu::{OptionExt, ResultExt};
use std::time::Duration;
use tracing::{event, instrument, Level};

/// When a `Shim` should next be reconciled if no watch event arrives first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Requeue {
    Immediately,
    After(Duration),
    /// After an exponentially growing delay, as for errors.
    Backoff,
    /// Only when a watch event arrives.
    Never,
}

/// The status one pass computed for a `Shim`, before it is written.
#[derive(Clone, Debug, PartialEq)]
pub struct PassOutcome {
    pub status: ShimStatus,
    pub requeue: Requeue,
}

/// What a completed pass did.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    pub requeue: Requeue,
    /// The status the `Shim` holds after the pass, when it was computed.
    pub status: Option<ShimStatus>,
}

impl Reconciled {
    fn requeue(requeue: Requeue) -> Self {
        Reconciled {
            requeue,
            status: None,
        }
    }
}

fn node_names(nodes: &[NodeReference]) -> String {
    nodes
        .iter()
        .map(|node| node.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Computes the status a `Shim` should hold given the current node inventory.
///
/// Passes keep no memory beyond what the persisted status records, so repeated invocations over
/// the same `Shim` and inventory converge on the same result.
#[instrument(
    skip(shim, nodes, intervals),
    fields(shim = %shim.key(), generation = shim.generation())
)]
pub fn compute_next_status(
    shim: &Shim,
    nodes: &[NodeInfo],
    intervals: &PollIntervals,
    now: DateTime<Utc>,
) -> PassOutcome {
    let generation = shim.generation();
    let mut next = shim.status.clone().unwrap_or_default();
    next.observed_generation = generation;

    let spec = match shim.spec.validated() {
        Ok(spec) => spec,
        Err(err) => {
            event!(Level::WARN, %err, "Shim spec is invalid, skipping rollout.");
            set_condition(
                &mut next.conditions,
                StatusCondition::new(CONDITION_VALID, false, REASON_INVALID_SPEC, err.to_string()),
                generation,
                now,
            );
            // Nothing changes until the `Shim` is edited, which produces a watch event.
            return PassOutcome {
                status: next,
                requeue: Requeue::Never,
            };
        }
    };
    set_condition(
        &mut next.conditions,
        StatusCondition::new(CONDITION_VALID, true, REASON_SPEC_VALID, "spec is valid"),
        generation,
        now,
    );

    let source_changed = next.observed_source.as_ref() != Some(&shim.spec.source);
    let restarting = source_changed && next.observed_source.is_some();
    if restarting {
        event!(
            Level::INFO,
            "Shim source changed, requeueing every node for a fresh rollout."
        );
        planner::requeue_all(&mut next);
    }
    if source_changed {
        next.observed_source = Some(shim.spec.source.clone());
        next.source_generation = generation;
    }

    let target = selector::select(spec.node_selector, nodes);
    let classification = classifier::classify(&target, &next);
    let key = shim.key();
    let plan = match spec.strategy {
        // The reset is published on its own so the all-queued state is observable.
        _ if restarting => planner::hold(&classification),
        RolloutStrategy::Rolling { max_unavailable } => planner::plan(
            &classification,
            &CompletionSignals {
                shim: &key,
                source_generation: next.source_generation,
            },
            max_unavailable,
        ),
    };

    if !plan.dropped.is_empty() {
        event!(Level::INFO, dropped = %node_names(&plan.dropped), "Dropped stale node references.");
    }
    if !plan.completed.is_empty() {
        event!(Level::INFO, completed = %node_names(&plan.completed), "Nodes finished upgrading.");
    }
    if !plan.promoted.is_empty() {
        event!(
            Level::INFO,
            promoted = %node_names(&plan.promoted),
            max_unavailable = plan.max_unavailable,
            "Nodes began upgrading."
        );
    }
    plan.apply_to(&mut next);

    let progress = format!(
        "{}/{} nodes upgraded",
        plan.upgraded.len(),
        plan.target_size()
    );
    let rollout = if restarting {
        StatusCondition::new(
            CONDITION_ROLLOUT_COMPLETE,
            false,
            REASON_SOURCE_CHANGED,
            format!("source changed, restarting rollout: {}", progress),
        )
    } else if plan.is_complete() {
        StatusCondition::new(
            CONDITION_ROLLOUT_COMPLETE,
            true,
            REASON_ALL_NODES_UPGRADED,
            progress,
        )
    } else {
        StatusCondition::new(
            CONDITION_ROLLOUT_COMPLETE,
            false,
            REASON_ROLLOUT_IN_PROGRESS,
            progress,
        )
    };
    set_condition(&mut next.conditions, rollout, generation, now);

    let failures = if plan.failed.is_empty() {
        StatusCondition::new(
            CONDITION_NODE_INSTALL_FAILED,
            false,
            REASON_NO_FAILURES,
            "",
        )
    } else {
        event!(
            Level::WARN,
            failed = %node_names(&plan.failed),
            "Shim installation failed on nodes."
        );
        StatusCondition::new(
            CONDITION_NODE_INSTALL_FAILED,
            true,
            REASON_INSTALLER_REPORTED_FAILURE,
            format!("installation failed on nodes: {}", node_names(&plan.failed)),
        )
    };
    set_condition(&mut next.conditions, failures, generation, now);

    let requeue = if restarting {
        Requeue::Immediately
    } else if !plan.upgrading.is_empty() {
        // Installer reports arrive on Node objects; poll for them while upgrades are in flight.
        Requeue::After(intervals.upgrade)
    } else {
        Requeue::Never
    };

    PassOutcome {
        status: next,
        requeue,
    }
}

/// Drives one `Shim` through a single reconciliation pass.
pub struct ShimReconciler<C: ShimClient, I: NodeInventory, A: CleanupAgent> {
    client: C,
    inventory: I,
    finalizers: FinalizerLifecycle<C, A>,
    intervals: PollIntervals,
}

impl<C, I, A> ShimReconciler<C, I, A>
where
    C: ShimClient,
    I: NodeInventory,
    A: CleanupAgent,
{
    pub fn new(client: C, inventory: I, cleanup: A, intervals: PollIntervals) -> Self {
        ShimReconciler {
            finalizers: FinalizerLifecycle::new(client.clone(), cleanup),
            client,
            inventory,
            intervals,
        }
    }

    /// Runs one pass: read the `Shim`, advance its lifecycle, and write at most one change.
    ///
    /// Every pass starts from a fresh read. A conflicting write means the object changed under us,
    /// so the pass is simply repeated rather than merged.
    #[instrument(skip(self, key), fields(shim = %key), err)]
    pub async fn reconcile(&self, key: &ShimKey) -> Result<Reconciled> {
        let shim = match self
            .client
            .get_shim(key)
            .await
            .context(error::UpdateShimSnafu)?
        {
            Some(shim) => shim,
            None => {
                event!(Level::DEBUG, "Shim no longer exists.");
                return Ok(Reconciled::requeue(Requeue::Never));
            }
        };

        let phase = ResourcePhase::of(&shim);
        event!(Level::DEBUG, ?phase, "Fetched Shim.");
        match phase {
            ResourcePhase::Unguarded => {
                let requeue = match self.finalizers.ensure_present(&shim).await? {
                    Some(WriteOutcome::NotFound) => Requeue::Never,
                    // Also on conflict: the next pass rereads and tries again.
                    _ => Requeue::Immediately,
                };
                Ok(Reconciled::requeue(requeue))
            }
            ResourcePhase::Released => Ok(Reconciled::requeue(Requeue::Never)),
            ResourcePhase::Terminating => {
                match self.finalizers.ensure_cleaned_up_and_removed(&shim).await? {
                    Termination::Released(WriteOutcome::Conflict) => {
                        Ok(Reconciled::requeue(Requeue::Immediately))
                    }
                    Termination::Released(_) => Ok(Reconciled::requeue(Requeue::Never)),
                    Termination::Pending(reason) => {
                        let status = terminating_status(&shim, REASON_CLEANUP_PENDING, reason);
                        self.publish(&shim, status, Requeue::After(self.intervals.cleanup))
                            .await
                    }
                    Termination::Failed(reason) => {
                        let status = terminating_status(&shim, REASON_CLEANUP_FAILED, reason);
                        self.publish(&shim, status, Requeue::Backoff).await
                    }
                }
            }
            ResourcePhase::Active => {
                let nodes = self.inventory.list_nodes();
                let outcome = compute_next_status(&shim, &nodes, &self.intervals, Utc::now());
                self.publish(&shim, outcome.status, outcome.requeue).await
            }
        }
    }

    /// Writes `status` if it differs from what the `Shim` holds, conditioned on the version read.
    async fn publish(
        &self,
        shim: &Shim,
        status: ShimStatus,
        requeue: Requeue,
    ) -> Result<Reconciled> {
        if shim.status.as_ref() == Some(&status) {
            event!(Level::DEBUG, "Shim status is up to date.");
            return Ok(Reconciled {
                requeue,
                status: Some(status),
            });
        }

        let key = shim.key();
        let version = shim
            .resource_version()
            .context(error::MissingResourceVersionSnafu { key: key.clone() })?;
        let outcome = self
            .client
            .update_shim_status(&key, &status, &version)
            .await
            .context(error::UpdateShimSnafu)?;

        Ok(match outcome {
            WriteOutcome::Applied => Reconciled {
                requeue,
                status: Some(status),
            },
            WriteOutcome::Conflict => {
                event!(Level::DEBUG, "Shim changed since it was read, retrying.");
                Reconciled::requeue(Requeue::Immediately)
            }
            WriteOutcome::NotFound => Reconciled::requeue(Requeue::Never),
        })
    }
}

fn terminating_status(shim: &Shim, reason: &'static str, message: String) -> ShimStatus {
    let mut status = shim.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        StatusCondition::new(CONDITION_TERMINATING, true, reason, message),
        shim.generation(),
        Utc::now(),
    );
    status
}
