//! Nodes grouped by zone, listed round-robin across zones.

use crate::error::{Result, SchedulerError};
use placement_core::{zone_key, Node};
use std::collections::HashMap;
use tracing::warn;

/// A zone-to-nodes index giving a stable traversal order that interleaves
/// zones, so that the first nodes evaluated in a cycle span every zone.
#[derive(Debug, Clone, Default)]
pub struct NodeTree {
    tree: HashMap<String, Vec<String>>,
    zones: Vec<String>,
    num_nodes: usize,
}

impl NodeTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Add a node. Adding a known node is a no-op.
    pub fn add(&mut self, node: &Node) {
        let zone = zone_key(node.labels());
        let name = node.name().to_string();
        match self.tree.get_mut(&zone) {
            Some(names) => {
                if names.contains(&name) {
                    warn!(node = %name, "Node already exists in the node tree");
                    return;
                }
                names.push(name);
            }
            None => {
                self.zones.push(zone.clone());
                self.tree.insert(zone, vec![name]);
            }
        }
        self.num_nodes += 1;
    }

    /// Remove a node.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NodeNotFound`] if the node is not in its zone.
    pub fn remove(&mut self, node: &Node) -> Result<()> {
        let zone = zone_key(node.labels());
        let names = self
            .tree
            .get_mut(&zone)
            .ok_or_else(|| SchedulerError::NodeNotFound(node.name().to_string()))?;
        let index = names
            .iter()
            .position(|n| n == node.name())
            .ok_or_else(|| SchedulerError::NodeNotFound(node.name().to_string()))?;
        names.remove(index);
        if names.is_empty() {
            self.tree.remove(&zone);
            self.zones.retain(|z| z != &zone);
        }
        self.num_nodes -= 1;
        Ok(())
    }

    /// Move a node between zones if its zone changed.
    pub fn update(&mut self, old: Option<&Node>, new: &Node) {
        if let Some(old) = old {
            if zone_key(old.labels()) == zone_key(new.labels()) {
                return;
            }
            if let Err(e) = self.remove(old) {
                warn!(node = %old.name(), error = %e, "Failed to remove node from node tree");
            }
        }
        self.add(new);
    }

    /// All node names, taking one node from each zone in turn.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.num_nodes);
        let mut index = 0;
        while out.len() < self.num_nodes {
            let mut exhausted = 0;
            for zone in &self.zones {
                match self.tree.get(zone).and_then(|names| names.get(index)) {
                    Some(name) => out.push(name.clone()),
                    None => exhausted += 1,
                }
            }
            if exhausted == self.zones.len() {
                break;
            }
            index += 1;
        }
        out
    }
}
