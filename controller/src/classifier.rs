use models::node::NodeInfo;
use models::shim::{NodeReference, ShimStatus};

use std::collections::{BTreeMap, BTreeSet};

/// The rollout state of every targeted node, as recorded in a `ShimStatus`.
///
/// `upgraded`, `upgrading` and `queued` partition the target set. `stale` holds the recorded
/// references which no longer name a targeted node, either because the node left the target set or
/// because its name now belongs to a different node.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Classification<'a> {
    pub upgraded: Vec<&'a NodeInfo>,
    pub upgrading: Vec<&'a NodeInfo>,
    pub queued: Vec<&'a NodeInfo>,
    pub stale: Vec<NodeReference>,
}

impl<'a> Classification<'a> {
    pub fn target_size(&self) -> usize {
        self.upgraded.len() + self.upgrading.len() + self.queued.len()
    }
}

fn recorded(list: &[NodeReference]) -> BTreeSet<(&str, &str)> {
    list.iter()
        .map(|node| (node.name.as_str(), node.uid.as_str()))
        .collect()
}

/// Classifies each node of `target` by the first status list recording it with a matching uid,
/// in the order upgraded, upgrading, queued. Nodes recorded nowhere are newly targeted and start
/// queued.
pub fn classify<'a>(target: &[&'a NodeInfo], status: &ShimStatus) -> Classification<'a> {
    let upgraded = recorded(&status.upgraded_nodes);
    let upgrading = recorded(&status.upgrading_nodes);

    let mut classification = Classification::default();
    for node in target {
        let key = (node.name.as_str(), node.uid.as_str());
        if upgraded.contains(&key) {
            classification.upgraded.push(*node);
        } else if upgrading.contains(&key) {
            classification.upgrading.push(*node);
        } else {
            classification.queued.push(*node);
        }
    }

    let target_uids: BTreeMap<&str, &str> = target
        .iter()
        .map(|node| (node.name.as_str(), node.uid.as_str()))
        .collect();
    let mut stale: Vec<NodeReference> = status
        .upgraded_nodes
        .iter()
        .chain(&status.upgrading_nodes)
        .chain(&status.queued_nodes)
        .filter(|node| target_uids.get(node.name.as_str()) != Some(&node.uid.as_str()))
        .cloned()
        .collect();
    stale.sort();
    stale.dedup();
    classification.stale = stale;

    classification
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(name: &str) -> NodeInfo {
        NodeInfo::new(name, format!("{}-uid", name))
    }

    fn reference(name: &str) -> NodeReference {
        NodeReference::new(name, format!("{}-uid", name))
    }

    fn names(nodes: &[&NodeInfo]) -> Vec<String> {
        nodes.iter().map(|node| node.name.clone()).collect()
    }

    #[test]
    fn test_new_nodes_start_queued() {
        let inventory = vec![node("a"), node("b")];
        let target: Vec<&NodeInfo> = inventory.iter().collect();

        let classification = classify(&target, &ShimStatus::default());
        assert_eq!(names(&classification.queued), vec!["a", "b"]);
        assert!(classification.upgraded.is_empty());
        assert!(classification.upgrading.is_empty());
        assert!(classification.stale.is_empty());
    }

    #[test]
    fn test_recorded_nodes_keep_their_state() {
        let inventory = vec![node("a"), node("b"), node("c"), node("d")];
        let target: Vec<&NodeInfo> = inventory.iter().collect();
        let status = ShimStatus {
            upgraded_nodes: vec![reference("a")],
            upgrading_nodes: vec![reference("b")],
            queued_nodes: vec![reference("c")],
            ..Default::default()
        };

        let classification = classify(&target, &status);
        assert_eq!(names(&classification.upgraded), vec!["a"]);
        assert_eq!(names(&classification.upgrading), vec!["b"]);
        assert_eq!(names(&classification.queued), vec!["c", "d"]);
        assert_eq!(classification.target_size(), 4);
    }

    #[test]
    fn test_stale_references() {
        let recycled = NodeInfo::new("b", "new-uid");
        let inventory = vec![node("a"), recycled];
        let target: Vec<&NodeInfo> = inventory.iter().collect();
        let status = ShimStatus {
            upgraded_nodes: vec![reference("a"), reference("gone")],
            upgrading_nodes: vec![reference("b")],
            ..Default::default()
        };

        let classification = classify(&target, &status);
        assert_eq!(names(&classification.upgraded), vec!["a"]);
        // The recycled name is a new node, so it starts over.
        assert_eq!(names(&classification.queued), vec!["b"]);
        assert!(classification.upgrading.is_empty());
        assert_eq!(
            classification.stale,
            vec![reference("b"), reference("gone")]
        );
    }

    #[test]
    fn test_duplicate_entries_take_most_advanced_state() {
        let inventory = vec![node("a")];
        let target: Vec<&NodeInfo> = inventory.iter().collect();
        let status = ShimStatus {
            upgraded_nodes: vec![reference("a")],
            upgrading_nodes: vec![reference("a")],
            queued_nodes: vec![reference("a")],
            ..Default::default()
        };

        let classification = classify(&target, &status);
        assert_eq!(names(&classification.upgraded), vec!["a"]);
        assert!(classification.upgrading.is_empty());
        assert!(classification.queued.is_empty());
    }
}
