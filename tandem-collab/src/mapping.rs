//! Mapping table: which local node currently represents which shared node.
//!
//! Entries are weak in the sense that they are only hints: a missing entry
//! costs a deep comparison or a re-projection, never correctness. After each
//! rebuild the table is pruned to the shared nodes that were visited, so
//! entries for deleted content do not linger.

use std::collections::{HashMap, HashSet};

use tandem_core::Node;

use crate::shared::NodeKey;

/// Local counterpart of a shared node: an element, or the group of text
/// nodes a text run projects to.
#[derive(Debug, Clone)]
pub enum Mapped {
    Element(Node),
    Text(Vec<Node>),
}

impl Mapped {
    pub fn size(&self) -> u32 {
        match self {
            Mapped::Element(node) => node.node_size(),
            Mapped::Text(nodes) => nodes.iter().map(Node::node_size).sum(),
        }
    }

    /// Identity comparison against a local element.
    pub fn is_element(&self, node: &Node) -> bool {
        matches!(self, Mapped::Element(mapped) if Node::ptr_eq(mapped, node))
    }

    /// Identity comparison against a local text group.
    pub fn is_text_group(&self, nodes: &[Node]) -> bool {
        match self {
            Mapped::Text(mapped) => {
                mapped.len() == nodes.len() && mapped.iter().zip(nodes).all(|(a, b)| Node::ptr_eq(a, b))
            }
            Mapped::Element(_) => false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Mapping {
    entries: HashMap<NodeKey, Mapped>,
    /// Element address → key, so one local element never backs two shared nodes.
    owners: HashMap<usize, NodeKey>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&Mapped> {
        self.entries.get(key)
    }

    pub fn element(&self, key: &NodeKey) -> Option<&Node> {
        match self.entries.get(key) {
            Some(Mapped::Element(node)) => Some(node),
            _ => None,
        }
    }

    /// Local size of the node mapped to `key`; 0 when unmapped.
    pub fn size(&self, key: &NodeKey) -> u32 {
        self.entries.get(key).map(Mapped::size).unwrap_or(0)
    }

    pub fn set_element(&mut self, key: NodeKey, node: Node) {
        if let Some(Mapped::Element(old)) = self.entries.remove(&key) {
            self.release(&old, &key);
        }
        if let Some(previous) = self.owners.insert(node.addr(), key.clone()) {
            if previous != key {
                self.entries.remove(&previous);
            }
        }
        self.entries.insert(key, Mapped::Element(node));
    }

    pub fn set_text(&mut self, key: NodeKey, nodes: Vec<Node>) {
        if let Some(Mapped::Element(old)) = self.entries.remove(&key) {
            self.release(&old, &key);
        }
        self.entries.insert(key, Mapped::Text(nodes));
    }

    pub fn remove(&mut self, key: &NodeKey) -> Option<Mapped> {
        let removed = self.entries.remove(key);
        if let Some(Mapped::Element(node)) = &removed {
            self.release(node, key);
        }
        removed
    }

    /// Drop the entries of structurally touched shared nodes.
    pub fn invalidate<'a>(&mut self, keys: impl IntoIterator<Item = &'a NodeKey>) {
        for key in keys {
            self.remove(key);
        }
    }

    /// Keep only entries whose key is in `visited`.
    pub fn retain(&mut self, visited: &HashSet<NodeKey>) {
        self.entries.retain(|key, _| visited.contains(key));
        self.owners.retain(|_, key| visited.contains(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.owners.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn release(&mut self, node: &Node, key: &NodeKey) {
        if self.owners.get(&node.addr()) == Some(key) {
            self.owners.remove(&node.addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tandem_core::{Attrs, NodeSpec, Schema};
    use yrs::ID;

    fn paragraph() -> Node {
        let schema = Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("inline*").group("block"),
            ],
            vec![],
        )
        .unwrap();
        schema.node("paragraph", Attrs::new(), vec![]).unwrap()
    }

    #[test]
    fn test_one_local_node_per_shared_node() {
        let mut mapping = Mapping::new();
        let p = paragraph();
        let a = NodeKey::Item(ID::new(1, 0));
        let b = NodeKey::Item(ID::new(1, 5));
        mapping.set_element(a.clone(), p.clone());
        mapping.set_element(b.clone(), p.clone());
        assert!(mapping.get(&a).is_none());
        assert!(mapping.get(&b).unwrap().is_element(&p));
    }

    #[test]
    fn test_size_defaults_to_zero() {
        let mapping = Mapping::new();
        assert_eq!(mapping.size(&NodeKey::Root(Arc::from("x"))), 0);
    }

    #[test]
    fn test_retain_prunes_unvisited() {
        let mut mapping = Mapping::new();
        let a = NodeKey::Item(ID::new(1, 0));
        let b = NodeKey::Item(ID::new(2, 0));
        mapping.set_element(a.clone(), paragraph());
        mapping.set_text(b.clone(), vec![]);
        let visited: HashSet<NodeKey> = [b.clone()].into_iter().collect();
        mapping.retain(&visited);
        assert_eq!(mapping.len(), 1);
        assert!(mapping.get(&b).is_some());
    }

    #[test]
    fn test_invalidate() {
        let mut mapping = Mapping::new();
        let a = NodeKey::Item(ID::new(1, 0));
        mapping.set_element(a.clone(), paragraph());
        mapping.invalidate([&a]);
        assert!(mapping.is_empty());
    }
}
