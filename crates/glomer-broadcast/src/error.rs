//! Error types for glomer-broadcast.

use thiserror::Error;

use crate::message::{
    CRASH, MALFORMED_REQUEST, NODE_NOT_FOUND, NOT_SUPPORTED, TEMPORARILY_UNAVAILABLE, TIMEOUT,
};
use crate::protocol::NodeId;

/// Errors raised by a transport while talking to a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No reply arrived within the transport's timeout.
    #[error("rpc to {dest} timed out")]
    Timeout {
        /// The node that did not answer.
        dest: NodeId,
    },

    /// The destination cannot currently be reached (e.g. partitioned).
    #[error("node {dest} is unreachable")]
    Unreachable {
        /// The node that could not be reached.
        dest: NodeId,
    },

    /// The destination is not a member of the cluster.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,

    /// The peer answered with an error body or an unexpected reply.
    #[error("request rejected by {dest} (code {code}): {text}")]
    Rejected {
        /// The node that rejected the request.
        dest: NodeId,
        /// Error code carried by the reply.
        code: u32,
        /// Human-readable reason.
        text: String,
    },
}

/// Errors that can occur while handling broadcast requests.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The request body could not be decoded.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// A topology message has no entry for this node.
    #[error("topology has no entry for node {node_id}")]
    TopologyMissingNode {
        /// This node's identifier.
        node_id: NodeId,
    },

    /// The message type is not handled here.
    #[error("unsupported message type: {0}")]
    Unsupported(String),

    /// The node has not received its identity yet.
    #[error("node is not initialized")]
    NotInitialized,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BroadcastError {
    /// Returns the wire error code reported to the requester.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Malformed(_) | Self::TopologyMissingNode { .. } | Self::Json(_) => {
                MALFORMED_REQUEST
            }
            Self::Unsupported(_) => NOT_SUPPORTED,
            Self::NotInitialized => TEMPORARILY_UNAVAILABLE,
            Self::Transport(TransportError::Timeout { .. }) => TIMEOUT,
            Self::Transport(TransportError::UnknownNode(_)) => NODE_NOT_FOUND,
            Self::Transport(TransportError::Rejected { code, .. }) => *code,
            Self::Transport(_) => CRASH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(BroadcastError::Malformed("bad".into()), MALFORMED_REQUEST ; "malformed")]
    #[test_case(BroadcastError::TopologyMissingNode { node_id: "n1".into() }, MALFORMED_REQUEST ; "topology missing node")]
    #[test_case(BroadcastError::Unsupported("echo".into()), NOT_SUPPORTED ; "unsupported")]
    #[test_case(BroadcastError::NotInitialized, TEMPORARILY_UNAVAILABLE ; "not initialized")]
    #[test_case(BroadcastError::Transport(TransportError::Timeout { dest: "n2".into() }), TIMEOUT ; "timeout")]
    #[test_case(BroadcastError::Transport(TransportError::UnknownNode("n9".into())), NODE_NOT_FOUND ; "unknown node")]
    #[test_case(BroadcastError::Transport(TransportError::Closed), CRASH ; "closed")]
    fn error_codes(error: BroadcastError, expected: u32) {
        assert_eq!(error.code(), expected);
    }

    #[test]
    fn rejected_keeps_remote_code() {
        let error = BroadcastError::from(TransportError::Rejected {
            dest: "n2".into(),
            code: 22,
            text: "nope".into(),
        });
        assert_eq!(error.code(), 22);
        assert!(error.to_string().contains("n2"));
    }
}
