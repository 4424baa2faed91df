//! Wire message definitions.
//!
//! Every message is a JSON envelope `{"src", "dest", "body"}`. The body
//! carries a `type` tag, optional `msg_id`/`in_reply_to` correlation headers
//! and the fields of its variant:
//!
//! ```json
//! {"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 3, "message": 5}}
//! ```
//!
//! Bodies are decoded in two steps: [`RawMessage`] keeps the body untyped so
//! a malformed request can still be answered, then [`RawMessage::parse`]
//! validates it into the closed [`Payload`] set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::BroadcastError;
use crate::protocol::{NodeId, Value};

// Maelstrom error codes
/// The requested operation timed out.
pub const TIMEOUT: u32 = 0;
/// The destination node does not exist.
pub const NODE_NOT_FOUND: u32 = 1;
/// The message type is not supported.
pub const NOT_SUPPORTED: u32 = 10;
/// The node cannot serve the request right now.
pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
/// The request body is malformed.
pub const MALFORMED_REQUEST: u32 = 12;
/// Indefinite failure.
pub const CRASH: u32 = 13;

/// Typed message bodies understood by a broadcast node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Node identity assignment, sent once by the runtime harness.
    Init {
        /// This node's identifier.
        node_id: NodeId,
        /// Every node in the cluster, including this one.
        node_ids: Vec<NodeId>,
    },
    /// Acknowledges `init`.
    InitOk,
    /// Client request to broadcast a value.
    Broadcast {
        /// The value.
        message: Value,
    },
    /// Acknowledges local acceptance of a broadcast.
    BroadcastOk,
    /// Peer-to-peer propagation of a value.
    BroadcastForward {
        /// The value.
        message: Value,
    },
    /// Acknowledges receipt of a forward.
    BroadcastForwardOk,
    /// Request for every value known to the node.
    Read,
    /// Answer to `read`.
    ReadOk {
        /// Every known value, unordered.
        messages: Vec<Value>,
    },
    /// Neighbor configuration for the cluster.
    Topology {
        /// Node identifier to its gossip neighbors.
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    /// Acknowledges `topology`.
    TopologyOk,
    /// Request failure.
    Error {
        /// Error code.
        code: u32,
        /// Human-readable reason.
        text: String,
    },
}

impl Payload {
    /// Every `type` tag this node can decode.
    pub const KINDS: [&'static str; 11] = [
        "init",
        "init_ok",
        "broadcast",
        "broadcast_ok",
        "broadcast_forward",
        "broadcast_forward_ok",
        "read",
        "read_ok",
        "topology",
        "topology_ok",
        "error",
    ];

    /// Returns the wire `type` tag of this payload.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::InitOk => "init_ok",
            Self::Broadcast { .. } => "broadcast",
            Self::BroadcastOk => "broadcast_ok",
            Self::BroadcastForward { .. } => "broadcast_forward",
            Self::BroadcastForwardOk => "broadcast_forward_ok",
            Self::Read => "read",
            Self::ReadOk { .. } => "read_ok",
            Self::Topology { .. } => "topology",
            Self::TopologyOk => "topology_ok",
            Self::Error { .. } => "error",
        }
    }

    /// Creates an error payload.
    #[must_use]
    pub fn error(code: u32, text: impl Into<String>) -> Self {
        Self::Error {
            code,
            text: text.into(),
        }
    }

    /// Returns true for acknowledgement and error bodies.
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::InitOk
                | Self::BroadcastOk
                | Self::BroadcastForwardOk
                | Self::ReadOk { .. }
                | Self::TopologyOk
                | Self::Error { .. }
        )
    }
}

/// A message body: correlation headers plus a typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// Identifier of this message, present when a reply is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// Identifier of the request this body answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    /// The typed payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Body {
    /// Creates a body with no correlation headers.
    #[must_use]
    pub const fn new(payload: Payload) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }

    /// Creates a request body that expects a reply.
    #[must_use]
    pub const fn request(msg_id: u64, payload: Payload) -> Self {
        Self {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        }
    }

    /// Sets the identifier of the request this body answers.
    #[must_use]
    pub fn replying_to(mut self, msg_id: Option<u64>) -> Self {
        self.in_reply_to = msg_id;
        self
    }

    /// Validates an untyped JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Malformed`] if the body has no `type` tag or
    /// its fields do not match the variant, and [`BroadcastError::Unsupported`]
    /// if the tag is not one of [`Payload::KINDS`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, BroadcastError> {
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| BroadcastError::Malformed("body has no type tag".to_string()))?;

        if !Payload::KINDS.contains(&kind) {
            return Err(BroadcastError::Unsupported(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| BroadcastError::Malformed(e.to_string()))
    }
}

/// A fully decoded message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender.
    pub src: NodeId,
    /// Recipient.
    pub dest: NodeId,
    /// Body.
    pub body: Body,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub const fn new(src: NodeId, dest: NodeId, body: Body) -> Self {
        Self { src, dest, body }
    }

    /// Builds the reply to this message, addressed back to its sender.
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body::new(payload).replying_to(self.body.msg_id),
        }
    }

    /// Serializes the message to a single JSON line (without the newline).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, BroadcastError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message envelope whose body has not been validated yet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawMessage {
    /// Sender.
    pub src: NodeId,
    /// Recipient.
    pub dest: NodeId,
    /// Untyped body.
    pub body: serde_json::Value,
}

impl RawMessage {
    /// Decodes an envelope from one line of JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a JSON envelope.
    pub fn from_json(line: &str) -> Result<Self, BroadcastError> {
        serde_json::from_str(line).map_err(|e| BroadcastError::Malformed(e.to_string()))
    }

    /// Returns the `msg_id` header if present.
    #[must_use]
    pub fn msg_id(&self) -> Option<u64> {
        self.body.get("msg_id").and_then(serde_json::Value::as_u64)
    }

    /// Returns the `in_reply_to` header if present.
    #[must_use]
    pub fn in_reply_to(&self) -> Option<u64> {
        self.body.get("in_reply_to").and_then(serde_json::Value::as_u64)
    }

    /// Validates the body into a typed [`Message`].
    ///
    /// # Errors
    ///
    /// See [`Body::from_value`].
    pub fn parse(self) -> Result<Message, BroadcastError> {
        let body = Body::from_value(self.body)?;
        Ok(Message {
            src: self.src,
            dest: self.dest,
            body,
        })
    }

    /// Builds an error reply for a request that failed validation.
    ///
    /// Returns `None` when the request carried no `msg_id` to answer.
    #[must_use]
    pub fn error_reply(&self, error: &BroadcastError) -> Option<Message> {
        let msg_id = self.msg_id()?;
        Some(Message {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body::new(Payload::error(error.code(), error.to_string()))
                .replying_to(Some(msg_id)),
        })
    }
}
