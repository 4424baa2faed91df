//! Broadcast dissemination over a gossip topology.
//!
//! New values spread in waves. A value first accepted from a client starts an
//! *origin* wave: every neighbor is retried until it acknowledges. A value
//! first accepted from a peer starts a *relay* wave: one attempt per neighbor,
//! since the origin is already retrying toward everyone.
//!
//! ## Architecture
//!
//! - [`Disseminator`]: Store, topology and fan-out of delivery tasks
//! - [`Propagation`]: Origin or relay policy of a wave
//! - [`DeliveryOutcome`]: How one (value, neighbor) delivery ended
//! - [`BroadcastNode`]: Request dispatch on top of the engine
//! - [`DisseminationStats`]: Wave and attempt counters

mod broadcast;
mod delivery;
mod node;
mod stats;

pub use broadcast::{DisseminationConfig, Disseminator};
pub use delivery::{DeliveryOutcome, Propagation};
pub use node::BroadcastNode;
pub use stats::{DisseminationStats, StatsSnapshot};
