//! Device registry
//!
//! Every peripheral the adapter has reported, in first-seen order. Records
//! are overwritten in place on each advertisement and never removed, so the
//! registry grows with the number of distinct addresses heard.

use parking_lot::RwLock;

use crate::adapter::{Node, RadioState};

pub struct DeviceRegistry {
    nodes: RwLock<Vec<Node>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Insert or overwrite the record for `node.address`.
    ///
    /// Returns `true` when the address was not known before. The radio state
    /// of an existing record survives, since advertisements do not carry it.
    pub fn upsert(&self, mut node: Node) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|n| n.has_address(&node.address)) {
            Some(existing) => {
                node.state = existing.state;
                *existing = node;
                false
            }
            None => {
                nodes.push(node);
                true
            }
        }
    }

    /// All records, or only connectable ones.
    pub fn list(&self, connectable_only: bool) -> Vec<Node> {
        self.nodes
            .read()
            .iter()
            .filter(|n| !connectable_only || n.connectable)
            .cloned()
            .collect()
    }

    pub fn find(&self, address: &str) -> Option<Node> {
        self.nodes.read().iter().find(|n| n.has_address(address)).cloned()
    }

    /// Record a radio state change. Unknown addresses are ignored.
    pub fn set_state(&self, address: &str, state: RadioState) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|n| n.has_address(address)) {
            Some(node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Forget every record. Only used when the radio restarts.
    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_then_find_by_any_spelling() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(Node::new("C0:AB:2A:6A:1A:89").with_rssi(-70)));

        let found = registry.find("c0ab2a6a1a89").unwrap();
        assert_eq!(found.rssi, Some(-70));
        assert!(registry.find("c0ab2a6a1a88").is_none());
    }

    #[test]
    fn test_upsert_overwrites_and_keeps_state() {
        let registry = DeviceRegistry::new();
        registry.upsert(Node::new("c0ab2a6a1a89").with_rssi(-70));
        registry.set_state("c0ab2a6a1a89", RadioState::Connected);

        assert!(!registry.upsert(Node::new("C0:AB:2A:6A:1A:89").with_rssi(-40)));
        let found = registry.find("c0ab2a6a1a89").unwrap();
        assert_eq!(found.rssi, Some(-40));
        assert_eq!(found.state, RadioState::Connected);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_connectable_only() {
        let registry = DeviceRegistry::new();
        registry.upsert(Node::new("aa"));
        registry.upsert(Node::new("bb").with_connectable(false));

        assert_eq!(registry.list(false).len(), 2);
        let connectable = registry.list(true);
        assert_eq!(connectable.len(), 1);
        assert_eq!(connectable[0].address, "aa");
    }

    #[test]
    fn test_set_state_unknown_address() {
        let registry = DeviceRegistry::new();
        assert!(!registry.set_state("aa", RadioState::Connected));
        assert!(registry.is_empty());
    }

    /// Records are never evicted and identical adverts are not collapsed:
    /// every distinct address stays for the life of the process.
    #[test]
    fn test_growth_is_unbounded() {
        let registry = DeviceRegistry::new();
        for i in 0..1000u32 {
            registry.upsert(Node::new(format!("{:012x}", i)));
        }
        for _ in 0..10 {
            registry.upsert(Node::new("000000000000"));
        }
        assert_eq!(registry.len(), 1000);
    }
}
