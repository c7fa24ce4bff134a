use nimbus_core::node::NodeRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

/// The fleet of node controllers, in configured slot order.
///
/// Slot identity is stable between reconfigurations: instance records
/// reference their hosting node by index into this Vec. Guarded by the
/// ResCache lock; fan-out sections snapshot it, release the lock, and commit
/// results back afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCache {
    nodes: Vec<NodeRecord>,
}

impl ResourceCache {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&NodeRecord> {
        self.nodes.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    pub fn find_by_host(&self, hostname: &str) -> Option<(usize, &NodeRecord)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.hostname == hostname)
    }

    /// Copy of the whole fleet, taken under the lock and worked on outside
    /// it.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.clone()
    }

    /// Write a worked-on snapshot back. Last write wins; refreshers accept
    /// overwriting concurrent updates.
    pub fn commit(&mut self, nodes: Vec<NodeRecord>) {
        self.nodes = nodes;
    }

    /// Replace the fleet after a reconfiguration. All slots restart fresh.
    pub fn replace_all(&mut self, nodes: Vec<NodeRecord>) {
        info!(
            old = self.nodes.len(),
            new = nodes.len(),
            "Replacing node list"
        );
        self.nodes = nodes;
    }

    /// Hostnames in slot order; used to decide whether a checkpointed fleet
    /// still matches the configuration.
    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.hostname.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::up_node;
    use nimbus_core::node::NodeState;

    #[test]
    fn test_slot_order_and_lookup() {
        let cache = ResourceCache::new(vec![up_node("nc1"), up_node("nc2")]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1).unwrap().hostname, "nc2");
        let (idx, node) = cache.find_by_host("nc2").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(node.hostname, "nc2");
        assert!(cache.find_by_host("nc9").is_none());
    }

    #[test]
    fn test_snapshot_commit_roundtrip() {
        let mut cache = ResourceCache::new(vec![up_node("nc1")]);
        let mut snap = cache.snapshot();
        snap[0].change_state(NodeState::Down);
        snap[0].zero_capacity();
        cache.commit(snap);
        assert_eq!(cache.get(0).unwrap().state, NodeState::Down);
        assert_eq!(cache.get(0).unwrap().max_cores, 0);
    }

    #[test]
    fn test_replace_all_resets_fleet() {
        let mut cache = ResourceCache::new(vec![up_node("nc1"), up_node("nc2")]);
        cache.replace_all(vec![up_node("nc3")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hostnames(), vec!["nc3"]);
    }
}
