//! Gossip neighbor table.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::BroadcastError;
use crate::protocol::NodeId;

/// The peers this node propagates values to.
///
/// Starts empty and is filled by a topology message. Additions are idempotent
/// and there is no removal path. While no neighbor is configured, every other
/// cluster node counts as a neighbor.
#[derive(Debug, Default)]
pub struct TopologyTable {
    neighbors: RwLock<Vec<NodeId>>,
}

impl TopologyTable {
    /// Creates an unconfigured table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds this node's neighbors from a cluster topology map.
    ///
    /// Returns the number of newly added neighbors. Neighbors that are already
    /// known, and `self_id` itself, are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::TopologyMissingNode`] if the map has no entry
    /// for `self_id`. The table is left untouched, so the fallback keeps applying.
    pub fn configure(
        &self,
        self_id: &NodeId,
        topology: &HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<usize, BroadcastError> {
        let peers = topology
            .get(self_id)
            .ok_or_else(|| BroadcastError::TopologyMissingNode {
                node_id: self_id.clone(),
            })?;

        let mut neighbors = self.neighbors.write();
        let mut added = 0;
        for peer in peers {
            if peer != self_id && !neighbors.contains(peer) {
                neighbors.push(peer.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Returns true if at least one neighbor has been configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.neighbors.read().is_empty()
    }

    /// Returns the explicitly configured neighbors, possibly empty.
    #[must_use]
    pub fn configured_neighbors(&self) -> Vec<NodeId> {
        self.neighbors.read().clone()
    }

    /// Returns the neighbors to propagate to.
    ///
    /// Falls back to every node in `all_nodes` except `self_id` when nothing
    /// was configured.
    #[must_use]
    pub fn neighbors(&self, self_id: &NodeId, all_nodes: &[NodeId]) -> Vec<NodeId> {
        let configured = self.neighbors.read();
        if configured.is_empty() {
            return all_nodes
                .iter()
                .filter(|node| *node != self_id)
                .cloned()
                .collect();
        }
        configured.clone()
    }
}
