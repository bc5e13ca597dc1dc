use models::node::NodeInfo;

use std::collections::BTreeMap;

/// Returns the nodes a `Shim` targets: those carrying every label in `selector` with an equal
/// value. An empty selector targets every node. Results are ordered by node name.
pub fn select<'a>(
    selector: &BTreeMap<String, String>,
    inventory: &'a [NodeInfo],
) -> Vec<&'a NodeInfo> {
    let mut target: Vec<&NodeInfo> = inventory
        .iter()
        .filter(|node| matches(selector, node))
        .collect();
    target.sort_by(|a, b| a.name.cmp(&b.name));
    target
}

fn matches(selector: &BTreeMap<String, String>, node: &NodeInfo) -> bool {
    selector
        .iter()
        .all(|(key, value)| node.labels.get(key) == Some(value))
}
