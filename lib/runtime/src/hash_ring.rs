//! Weighted virtual-node consistent-hash ring used by the broker to assign a routing key to a
//! shard/node without reshuffling every key when the node set changes.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A consistent-hash ring over `String` node identifiers.
#[derive(Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
    vnodes_per_node: hashbrown::HashMap<String, u32>,
}

impl HashRing {
    pub fn new() -> HashRing {
        HashRing { ring: BTreeMap::new(), vnodes_per_node: hashbrown::HashMap::new() }
    }

    /// Adds `node` with `vnode_count` virtual nodes spread across the ring. Re-adding a node with
    /// a different count first removes its previous virtual nodes.
    pub fn add_node(&mut self, node: &str, vnode_count: u32) {
        self.remove_node(node);

        for i in 0..vnode_count {
            let position = stable_hash(&format!("{}#{}", node, i));
            self.ring.insert(position, node.to_string());
        }

        self.vnodes_per_node.insert(node.to_string(), vnode_count);
    }

    /// Removes every virtual node belonging to `node`.
    pub fn remove_node(&mut self, node: &str) {
        if let Some(count) = self.vnodes_per_node.remove(node) {
            for i in 0..count {
                let position = stable_hash(&format!("{}#{}", node, i));
                self.ring.remove(&position);
            }
        }
    }

    /// Returns the node id responsible for `key`, or `None` if the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }

        let position = stable_hash(key);

        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn node_count(&self) -> usize {
        self.vnodes_per_node.len()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.vnodes_per_node.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_returns_none() {
        let ring = HashRing::new();
        assert_eq!(ring.get_node("anything"), None);
    }

    #[test]
    fn single_node_receives_every_key() {
        let mut ring = HashRing::new();
        ring.add_node("node-a", 8);

        for key in ["user_0", "user_1", "order_42"] {
            assert_eq!(ring.get_node(key), Some("node-a"));
        }
    }

    #[test]
    fn keys_are_stable_across_queries() {
        let mut ring = HashRing::new();
        ring.add_node("node-a", 16);
        ring.add_node("node-b", 16);

        let first = ring.get_node("user_7").unwrap().to_string();
        let second = ring.get_node("user_7").unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn removing_a_node_reassigns_only_its_keys() {
        let mut ring = HashRing::new();
        ring.add_node("node-a", 32);
        ring.add_node("node-b", 32);

        let keys: Vec<String> = (0..200).map(|i| format!("key_{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.get_node(k).unwrap().to_string())
            .collect();

        ring.remove_node("node-b");

        for (key, prior) in keys.iter().zip(before.iter()) {
            let after = ring.get_node(key).unwrap();
            if prior == "node-a" {
                assert_eq!(after, "node-a");
            }
        }
        assert_eq!(ring.node_count(), 1);
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut ring = HashRing::new();
        ring.add_node("node-a", 4);
        ring.clear();
        assert_eq!(ring.get_node("k"), None);
        assert_eq!(ring.node_count(), 0);
    }
}
