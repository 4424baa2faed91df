//! Core identifiers shared by every layer of the broadcast protocol.
//!
//! - [`NodeId`]: Identifier of a cluster node (`n1`) or a client (`c4`)
//! - [`Value`]: The unit of broadcast

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// A broadcast payload. Immutable once created, compared by equality.
pub type Value = i64;

/// Identifier of a node or client in the cluster.
///
/// Serialized as a bare JSON string so it can be used directly as a key of
/// the topology map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this identifier names a client rather than a cluster node.
    ///
    /// Clients are conventionally named `c<N>`.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.0.starts_with('c')
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
