//! The transport contract the engine depends on.
//!
//! Implementations handle framing, message IDs and reply correlation. The
//! engine only needs fire-and-forget sends, request/response RPCs, replies
//! to inbound requests, and the cluster membership.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransportError;
use crate::message::{Message, Payload};
use crate::protocol::NodeId;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Message transport between cluster nodes and clients.
///
/// The trait is object safe so the engine can hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Returns this node's identifier.
    fn node_id(&self) -> NodeId;

    /// Returns every node identifier in the cluster, including this node.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Sends a message without expecting a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be handed off. Success says
    /// nothing about delivery.
    fn send<'a>(&'a self, dest: &'a NodeId, payload: Payload)
        -> BoxFuture<'a, Result<(), TransportError>>;

    /// Sends a request and waits for the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is unknown or unreachable, or if no
    /// reply arrives within the transport's timeout.
    fn rpc<'a>(
        &'a self,
        dest: &'a NodeId,
        payload: Payload,
    ) -> BoxFuture<'a, Result<Payload, TransportError>>;

    /// Answers an inbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply could not be handed off.
    fn reply<'a>(
        &'a self,
        request: &'a Message,
        payload: Payload,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}
