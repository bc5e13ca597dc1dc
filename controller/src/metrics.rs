use models::shim::{ShimKey, ShimStatus};

use opentelemetry::metrics::{Meter, ObservableGauge};
use opentelemetry::{Key, KeyValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::instrument;

const SHIM_KEY: Key = Key::from_static_str("shim");
const NODE_STATE_KEY: Key = Key::from_static_str("state");

const UPGRADED: &str = "upgraded";
const UPGRADING: &str = "upgrading";
const QUEUED: &str = "queued";

/// Node counts per rollout state, for every `Shim` the controller has reconciled.
#[derive(Debug, Default)]
pub struct ShimRolloutData {
    nodes_by_shim: HashMap<ShimKey, [u64; 3]>,
}

impl ShimRolloutData {
    pub fn record(&mut self, shim: &ShimKey, status: &ShimStatus) {
        self.nodes_by_shim.insert(
            shim.clone(),
            [
                status.upgraded_nodes.len() as u64,
                status.upgrading_nodes.len() as u64,
                status.queued_nodes.len() as u64,
            ],
        );
    }

    pub fn forget(&mut self, shim: &ShimKey) {
        self.nodes_by_shim.remove(shim);
    }

    fn observations(&self) -> Vec<(u64, [KeyValue; 2])> {
        self.nodes_by_shim
            .iter()
            .flat_map(|(shim, counts)| {
                [UPGRADED, UPGRADING, QUEUED]
                    .into_iter()
                    .zip(counts.iter())
                    .map(move |(state, count)| {
                        (
                            *count,
                            [
                                SHIM_KEY.string(shim.to_string()),
                                NODE_STATE_KEY.string(state),
                            ],
                        )
                    })
            })
            .collect()
    }
}

pub struct ShimControllerMetrics {
    shim_shared_rollout_data: Arc<Mutex<ShimRolloutData>>,
    _shim_rollout_nodes_observer: ObservableGauge<u64>,
}

impl ShimControllerMetrics {
    #[instrument(skip(meter))]
    pub fn new(meter: Meter) -> Self {
        let shim_shared_rollout_data = Arc::new(Mutex::new(ShimRolloutData::default()));
        let rollout_data_for_observer = Arc::clone(&shim_shared_rollout_data);

        // Observer for the number of nodes in each rollout state, per shim
        let shim_rollout_nodes_observer = meter
            .u64_observable_gauge("shim_rollout_nodes")
            .with_description("Nodes targeted by a shim, by rollout state")
            .with_callback(move |observer| {
                if let Ok(data) = rollout_data_for_observer.lock() {
                    for (count, labels) in data.observations() {
                        observer.observe(count, &labels);
                    }
                }
            })
            .init();

        ShimControllerMetrics {
            shim_shared_rollout_data,
            _shim_rollout_nodes_observer: shim_rollout_nodes_observer,
        }
    }

    /// Update the shared rollout data read by the gauge observer.
    pub fn emit_metrics(&self, shim: &ShimKey, status: &ShimStatus) {
        if let Ok(mut data) = self.shim_shared_rollout_data.try_lock() {
            data.record(shim, status);
        }
    }

    /// Stop reporting a `Shim` that no longer exists.
    pub fn forget(&self, shim: &ShimKey) {
        if let Ok(mut data) = self.shim_shared_rollout_data.lock() {
            data.forget(shim);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::shim::NodeReference;

    fn status(upgraded: &[&str], upgrading: &[&str], queued: &[&str]) -> ShimStatus {
        let refs = |names: &[&str]| -> Vec<NodeReference> {
            names
                .iter()
                .map(|name| NodeReference::new(*name, format!("{}-uid", name)))
                .collect()
        };
        ShimStatus {
            upgraded_nodes: refs(upgraded),
            upgrading_nodes: refs(upgrading),
            queued_nodes: refs(queued),
            ..Default::default()
        }
    }

    fn count_for(data: &ShimRolloutData, shim: &str, state: &str) -> Option<u64> {
        data.observations()
            .into_iter()
            .find(|(_, labels)| {
                labels[0].value.as_str() == shim && labels[1].value.as_str() == state
            })
            .map(|(count, _)| count)
    }

    #[test]
    fn test_rollout_observations() {
        let spin = ShimKey::new("default", "spin");
        let slight = ShimKey::new("kube-system", "slight");

        let mut data = ShimRolloutData::default();
        data.record(&spin, &status(&["a"], &["b", "c"], &["d", "e"]));
        data.record(&slight, &status(&[], &[], &["a"]));
        assert_eq!(data.observations().len(), 6);
        assert_eq!(count_for(&data, "default/spin", UPGRADED), Some(1));
        assert_eq!(count_for(&data, "default/spin", UPGRADING), Some(2));
        assert_eq!(count_for(&data, "default/spin", QUEUED), Some(2));
        assert_eq!(count_for(&data, "kube-system/slight", QUEUED), Some(1));

        data.record(&spin, &status(&["a", "b", "c", "d", "e"], &[], &[]));
        assert_eq!(count_for(&data, "default/spin", UPGRADED), Some(5));
        assert_eq!(count_for(&data, "default/spin", QUEUED), Some(0));

        data.forget(&slight);
        assert_eq!(count_for(&data, "kube-system/slight", QUEUED), None);
        assert_eq!(data.observations().len(), 3);
    }
}
