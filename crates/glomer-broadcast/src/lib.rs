//! # glomer-broadcast
//!
//! Broadcast dissemination engine for a fixed-membership cluster of
//! message-passing nodes.
//!
//! This crate provides:
//!
//! - A deduplicating message store with an atomic insert-and-check
//! - A neighbor topology table with an "all other nodes" fallback
//! - Origin/relay fan-out: origin deliveries retry until acknowledged,
//!   relay deliveries make a single attempt
//! - Cooperative shutdown of every in-flight delivery
//!
//! ## Core Types
//!
//! - [`MessageStore`]: Set of every value this node has accepted
//! - [`TopologyTable`]: Gossip neighbors of this node
//! - [`Disseminator`]: The propagation engine
//! - [`BroadcastNode`]: Routes typed requests to the engine and replies
//! - [`Transport`]: What the engine needs from the node runtime
//! - [`MemoryNetwork`]: In-process cluster with partitions, for tests and simulation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod gossip;
pub mod memory;
pub mod message;
pub mod protocol;
pub mod store;
pub mod topology;
pub mod transport;

pub use error::{BroadcastError, TransportError};
pub use gossip::{
    BroadcastNode, DeliveryOutcome, DisseminationConfig, DisseminationStats, Disseminator,
    Propagation, StatsSnapshot,
};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{Body, Message, Payload, RawMessage};
pub use protocol::{NodeId, Value};
pub use store::MessageStore;
pub use topology::TopologyTable;
pub use transport::{BoxFuture, Transport};
