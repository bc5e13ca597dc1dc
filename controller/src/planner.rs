use crate::classifier::Classification;

use models::node::{NodeInfo, NodeShimState};
use models::shim::{MaxUnavailable, NodeReference, ShimKey, ShimStatus};

use tracing::instrument;

/// Resolves `max_unavailable` against the number of targeted nodes. Percentages round down, but a
/// non-empty target set always allows at least one node to upgrade so a rollout can't stall.
pub fn resolve_max_unavailable(max_unavailable: MaxUnavailable, target_size: usize) -> usize {
    if target_size == 0 {
        return 0;
    }
    let resolved = match max_unavailable {
        MaxUnavailable::Count(count) => count as usize,
        MaxUnavailable::Percent(percent) => percent as usize * target_size / 100,
    };
    resolved.max(1)
}

/// Reads node-side install reports for one shim, ignoring reports about an earlier source.
#[derive(Clone, Debug)]
pub struct CompletionSignals<'a> {
    pub shim: &'a ShimKey,
    pub source_generation: i64,
}

impl<'a> CompletionSignals<'a> {
    pub fn observe(&self, node: &NodeInfo) -> Option<NodeShimState> {
        node.install_report(self.shim)
            .filter(|report| report.is_current(self.source_generation))
            .map(|report| report.state)
    }
}

/// The node lists to publish after one planning step, plus what changed to get there.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct RolloutPlan {
    pub upgraded: Vec<NodeReference>,
    pub upgrading: Vec<NodeReference>,
    pub queued: Vec<NodeReference>,
    /// Nodes moved from queued to upgrading by this step.
    pub promoted: Vec<NodeReference>,
    /// Nodes moved from upgrading to upgraded by this step.
    pub completed: Vec<NodeReference>,
    /// Upgrading nodes whose installer reported failure. They keep occupying a slot.
    pub failed: Vec<NodeReference>,
    /// Stale references removed from the status.
    pub dropped: Vec<NodeReference>,
    pub max_unavailable: usize,
}

impl RolloutPlan {
    /// Whether every targeted node has been upgraded.
    pub fn is_complete(&self) -> bool {
        self.upgrading.is_empty() && self.queued.is_empty()
    }

    pub fn target_size(&self) -> usize {
        self.upgraded.len() + self.upgrading.len() + self.queued.len()
    }

    pub fn apply_to(&self, status: &mut ShimStatus) {
        status.upgraded_nodes = self.upgraded.clone();
        status.upgrading_nodes = self.upgrading.clone();
        status.queued_nodes = self.queued.clone();
    }
}

fn references(nodes: &[&NodeInfo]) -> Vec<NodeReference> {
    let mut references: Vec<NodeReference> = nodes.iter().map(|node| node.reference()).collect();
    references.sort();
    references
}

/// Publishes the classification as-is: stale references are dropped, but no node advances.
pub fn hold(classification: &Classification<'_>) -> RolloutPlan {
    RolloutPlan {
        upgraded: references(&classification.upgraded),
        upgrading: references(&classification.upgrading),
        queued: references(&classification.queued),
        dropped: classification.stale.clone(),
        ..Default::default()
    }
}

/// Computes the next step of a rolling rollout.
///
/// Upgrading nodes whose installer reports success become upgraded. The slots this frees, up to
/// `max_unavailable`, are filled with queued nodes in ascending name order. Nodes whose installer
/// reports failure stay upgrading and keep their slot until an operator or the installer retries.
#[instrument(skip(classification, signals), fields(target_size = classification.target_size()))]
pub fn plan(
    classification: &Classification<'_>,
    signals: &CompletionSignals<'_>,
    max_unavailable: MaxUnavailable,
) -> RolloutPlan {
    let max_unavailable = resolve_max_unavailable(max_unavailable, classification.target_size());
    let mut next = hold(classification);
    next.max_unavailable = max_unavailable;

    let mut in_flight = Vec::new();
    for node in &classification.upgrading {
        match signals.observe(node) {
            Some(NodeShimState::Installed) => next.completed.push(node.reference()),
            Some(NodeShimState::Failed) => {
                next.failed.push(node.reference());
                in_flight.push(node.reference());
            }
            Some(NodeShimState::UninstallFailed) | None => in_flight.push(node.reference()),
        }
    }
    next.completed.sort();
    next.failed.sort();
    in_flight.sort();

    let slots = max_unavailable.saturating_sub(in_flight.len());
    let mut queued = references(&classification.queued);
    next.promoted = queued.drain(..slots.min(queued.len())).collect();

    next.upgraded.extend(next.completed.iter().cloned());
    next.upgraded.sort();
    in_flight.extend(next.promoted.iter().cloned());
    in_flight.sort();
    next.upgrading = in_flight;
    next.queued = queued;

    next
}

/// Restarts the rollout for a new source: every node recorded in the status goes back to the queue,
/// since the binary it has, or is installing, is the wrong one.
pub fn requeue_all(status: &mut ShimStatus) {
    let mut queued: Vec<NodeReference> = status
        .upgraded_nodes
        .drain(..)
        .chain(status.upgrading_nodes.drain(..))
        .chain(status.queued_nodes.drain(..))
        .collect();
    queued.sort();
    queued.dedup_by(|a, b| a.name == b.name);
    status.queued_nodes = queued;
}
