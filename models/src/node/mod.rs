mod error;
mod report;

pub use self::error::Error as NodeError;
pub use self::report::{InstallReport, NodeShimState};

use crate::shim::{NodeReference, ShimKey};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{event, Level};

/// The parts of a cluster node the controller reasons about.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new<S1: Into<String>, S2: Into<String>>(name: S1, uid: S2) -> Self {
        NodeInfo {
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_annotation<S1: Into<String>, S2: Into<String>>(
        mut self,
        key: S1,
        value: S2,
    ) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns `None` for nodes the API server has not yet assigned a name and uid.
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(NodeInfo {
            name: node.metadata.name.clone()?,
            uid: node.metadata.uid.clone()?,
            labels: node.metadata.labels.clone().unwrap_or_default(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    pub fn reference(&self) -> NodeReference {
        NodeReference::new(self.name.clone(), self.uid.clone())
    }

    /// The latest report this node's installer published about the given shim, if any.
    /// Malformed reports are logged and ignored.
    pub fn install_report(&self, shim: &ShimKey) -> Option<InstallReport> {
        let raw = self.annotations.get(&shim.report_annotation_key())?;
        match raw.parse::<InstallReport>() {
            Ok(report) => Some(report),
            Err(err) => {
                event!(
                    Level::WARN,
                    node = %self.name,
                    %shim,
                    %err,
                    "Ignoring malformed shim install report."
                );
                None
            }
        }
    }
}

/// Read-only access to the nodes of the cluster. Implementations return an eventually-consistent
/// snapshot.
pub trait NodeInventory: Send + Sync {
    fn list_nodes(&self) -> Vec<NodeInfo>;
}

impl NodeInventory for Store<Node> {
    fn list_nodes(&self) -> Vec<NodeInfo> {
        self.state()
            .iter()
            .filter_map(|node| NodeInfo::from_node(node))
            .collect()
    }
}

/// A fixed snapshot of nodes.
impl NodeInventory for Vec<NodeInfo> {
    fn list_nodes(&self) -> Vec<NodeInfo> {
        self.clone()
    }
}

impl<T> NodeInventory for Arc<T>
where
    T: NodeInventory + ?Sized,
{
    fn list_nodes(&self) -> Vec<NodeInfo> {
        (**self).list_nodes()
    }
}
