//! The dissemination engine: dedup, neighbor selection and fan-out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::delivery::{Delivery, Propagation};
use super::stats::{DisseminationStats, StatsSnapshot};
use crate::error::BroadcastError;
use crate::protocol::{NodeId, Value};
use crate::store::MessageStore;
use crate::topology::TopologyTable;
use crate::transport::Transport;

/// Configuration for propagation behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisseminationConfig {
    /// Delay between failed origin delivery attempts.
    pub retry_interval: Duration,
    /// Skip the peer a value was received from when relaying it.
    pub exclude_sender: bool,
    /// Relay attempts wait for the peer's acknowledgement (RPC) instead of
    /// being sent fire-and-forget.
    pub relay_expects_reply: bool,
    /// Origin waves go to every other node regardless of the configured
    /// topology. Relays always follow the topology.
    pub origin_targets_all_nodes: bool,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            exclude_sender: true,
            relay_expects_reply: true,
            origin_targets_all_nodes: true,
        }
    }
}

impl DisseminationConfig {
    /// Sets the delay between origin retries.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Sets whether the immediate sender is skipped when relaying.
    #[must_use]
    pub const fn with_exclude_sender(mut self, exclude_sender: bool) -> Self {
        self.exclude_sender = exclude_sender;
        self
    }

    /// Sets whether relay attempts wait for an acknowledgement.
    #[must_use]
    pub const fn with_relay_expects_reply(mut self, relay_expects_reply: bool) -> Self {
        self.relay_expects_reply = relay_expects_reply;
        self
    }

    /// Sets whether origin waves ignore the topology.
    #[must_use]
    pub const fn with_origin_targets_all_nodes(mut self, origin_targets_all_nodes: bool) -> Self {
        self.origin_targets_all_nodes = origin_targets_all_nodes;
        self
    }
}

/// Broadcast dissemination engine.
///
/// Owns the message store and topology table, and spawns one delivery task
/// per (value, neighbor) when a value is accepted for the first time. All
/// delivery tasks share one cancellation token and are tracked so shutdown
/// can join them.
pub struct Disseminator {
    transport: Arc<dyn Transport>,
    config: DisseminationConfig,
    store: MessageStore,
    topology: TopologyTable,
    stats: Arc<DisseminationStats>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for Disseminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disseminator")
            .field("node_id", &self.transport.node_id())
            .field("config", &self.config)
            .field("store", &self.store)
            .field("topology", &self.topology)
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Disseminator {
    /// Creates an engine with its own shutdown token.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: DisseminationConfig) -> Self {
        Self::with_cancellation(transport, config, CancellationToken::new())
    }

    /// Creates an engine stopped by a process-wide shutdown token.
    #[must_use]
    pub fn with_cancellation(
        transport: Arc<dyn Transport>,
        config: DisseminationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            store: MessageStore::new(),
            topology: TopologyTable::new(),
            stats: Arc::new(DisseminationStats::new()),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    /// Returns the current config.
    #[must_use]
    pub const fn config(&self) -> &DisseminationConfig {
        &self.config
    }

    /// Returns the message store.
    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Returns the topology table.
    #[must_use]
    pub const fn topology(&self) -> &TopologyTable {
        &self.topology
    }

    /// Accepts a value from a client.
    ///
    /// Returns true if the value was new, in which case an origin wave was
    /// started. The caller acknowledges the client either way: the
    /// acknowledgement means "accepted locally", not "delivered everywhere".
    pub fn handle_broadcast(&self, value: Value) -> bool {
        let was_new = self.store.insert(value);
        if was_new {
            debug!(value, "accepted client broadcast");
            self.propagate(value, Propagation::Origin, None);
        }
        was_new
    }

    /// Accepts a value forwarded by a peer.
    ///
    /// Returns true if the value was new, in which case a relay wave was started.
    pub fn handle_forward(&self, value: Value, source: &NodeId) -> bool {
        let was_new = self.store.insert(value);
        if was_new {
            debug!(value, source = %source, "accepted forwarded value");
            self.propagate(value, Propagation::Relay, Some(source));
        } else {
            debug!(value, source = %source, "duplicate forward ignored");
        }
        was_new
    }

    /// Starts a propagation wave for `value`.
    ///
    /// Spawns one independent delivery task per target and returns how many
    /// were spawned. Targets come from [`Self::targets`]. When `exclude_sender`
    /// is set, `source` is skipped. After shutdown has been signaled nothing
    /// is spawned.
    pub fn propagate(
        &self,
        value: Value,
        propagation: Propagation,
        source: Option<&NodeId>,
    ) -> usize {
        if self.cancel.is_cancelled() {
            debug!(value, policy = %propagation, "shutting down, not propagating");
            return 0;
        }

        self.stats.record_wave(propagation);

        let targets: Vec<NodeId> = self
            .targets(propagation)
            .into_iter()
            .filter(|neighbor| !(self.config.exclude_sender && Some(neighbor) == source))
            .collect();

        debug!(
            value,
            policy = %propagation,
            targets = targets.len(),
            "starting propagation wave"
        );

        for neighbor in &targets {
            let delivery = Delivery {
                transport: Arc::clone(&self.transport),
                neighbor: neighbor.clone(),
                value,
                propagation,
                retry_interval: self.config.retry_interval,
                relay_expects_reply: self.config.relay_expects_reply,
                cancel: self.cancel.clone(),
                stats: Arc::clone(&self.stats),
            };
            self.tasks.spawn(delivery.run());
        }

        targets.len()
    }

    /// Applies a topology message.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::TopologyMissingNode`] if the map has no entry
    /// for this node; the all-nodes fallback stays in effect.
    pub fn configure_topology(
        &self,
        topology: &HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<usize, BroadcastError> {
        let node_id = self.transport.node_id();
        let added = self.topology.configure(&node_id, topology)?;
        info!(
            node_id = %node_id,
            added,
            neighbors = ?self.topology.configured_neighbors(),
            "topology configured"
        );
        Ok(added)
    }

    /// Returns the neighbors values are propagated to.
    #[must_use]
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.topology
            .neighbors(&self.transport.node_id(), &self.transport.node_ids())
    }

    /// Returns the nodes a wave of the given kind is sent to.
    ///
    /// With `origin_targets_all_nodes`, an origin wave reaches every other
    /// node so its retries can outlast a partition on any path. Relay waves
    /// use [`Self::neighbors`].
    #[must_use]
    pub fn targets(&self, propagation: Propagation) -> Vec<NodeId> {
        if propagation == Propagation::Origin && self.config.origin_targets_all_nodes {
            let node_id = self.transport.node_id();
            self.transport
                .node_ids()
                .into_iter()
                .filter(|id| *id != node_id)
                .collect()
        } else {
            self.neighbors()
        }
    }

    /// Returns every value this node has accepted, unordered.
    #[must_use]
    pub fn read(&self) -> Vec<Value> {
        self.store.snapshot()
    }

    /// Returns statistics about the engine state.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            stored_values: self.store.len(),
            ..self.stats.snapshot()
        }
    }

    /// Returns the number of delivery tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true once shutdown has been signaled.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals shutdown and waits for every delivery task to exit.
    ///
    /// Retry loops observe the signal at their next suspension point and end
    /// without completing delivery.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(stats = ?self.stats(), "dissemination engine stopped");
    }
}
