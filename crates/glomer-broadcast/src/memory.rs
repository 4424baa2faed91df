//! In-process cluster for tests and simulation.
//!
//! A [`MemoryNetwork`] wires a fixed set of [`BroadcastNode`]s together with
//! [`MemoryTransport`]s. Messages are routed through shared link state so
//! individual links can be cut, healed or made to fail a set number of
//! times. A message over a cut link fails immediately with
//! [`TransportError::Unreachable`]; an RPC whose reply never arrives fails
//! with [`TransportError::Timeout`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::gossip::{BroadcastNode, DisseminationConfig};
use crate::message::{Body, Message, Payload, RawMessage};
use crate::protocol::{NodeId, Value};
use crate::transport::{BoxFuture, Transport};

/// Default time an RPC waits for its reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Directed link between two endpoints.
type Link = (NodeId, NodeId);

#[derive(Debug)]
struct Attempt {
    src: NodeId,
    dest: NodeId,
    request: bool,
    delivered: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    cut: HashSet<Link>,
    failures: HashMap<Link, u32>,
    log: Vec<Attempt>,
}

impl LinkState {
    /// Returns true if the message must be dropped, consuming one injected
    /// failure if any remain.
    fn blocks(&mut self, link: &Link) -> bool {
        if self.cut.contains(link) {
            return true;
        }
        match self.failures.get_mut(link) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

struct NetworkInner {
    node_ids: Vec<NodeId>,
    nodes: RwLock<HashMap<NodeId, Arc<BroadcastNode>>>,
    links: Mutex<LinkState>,
    pending: Mutex<HashMap<(NodeId, u64), oneshot::Sender<Payload>>>,
    next_msg_id: AtomicU64,
    rpc_timeout: Duration,
    handlers: TaskTracker,
    cancel: CancellationToken,
}

impl NetworkInner {
    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, requester: &NodeId, msg_id: u64) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((requester.clone(), msg_id), tx);
        rx
    }

    /// Routes one message: replies complete a pending RPC, requests are
    /// handed to the destination node on its own task.
    fn route(&self, message: Message) -> Result<(), TransportError> {
        let link = (message.src.clone(), message.dest.clone());
        {
            let mut links = self.links.lock();
            let blocked = links.blocks(&link);
            links.log.push(Attempt {
                src: message.src.clone(),
                dest: message.dest.clone(),
                request: message.body.in_reply_to.is_none(),
                delivered: !blocked,
            });
            if blocked {
                trace!(
                    src = %link.0,
                    dest = %link.1,
                    kind = message.body.payload.kind(),
                    "dropped"
                );
                return Err(TransportError::Unreachable { dest: message.dest });
            }
        }

        if let Some(in_reply_to) = message.body.in_reply_to {
            match self.pending.lock().remove(&(message.dest.clone(), in_reply_to)) {
                Some(tx) => {
                    let _ = tx.send(message.body.payload);
                }
                None => debug!(dest = %message.dest, in_reply_to, "late reply dropped"),
            }
            return Ok(());
        }

        let node = self
            .nodes
            .read()
            .get(&message.dest)
            .cloned()
            .ok_or_else(|| TransportError::UnknownNode(message.dest.clone()))?;

        self.handlers.spawn(async move {
            if let Err(error) = node.handle(message).await {
                warn!(error = %error, "handler failed to reply");
            }
        });
        Ok(())
    }

    async fn await_reply(
        &self,
        requester: &NodeId,
        dest: &NodeId,
        msg_id: u64,
        rx: oneshot::Receiver<Payload>,
    ) -> Result<Payload, TransportError> {
        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&(requester.clone(), msg_id));
                Err(TransportError::Timeout { dest: dest.clone() })
            }
        }
    }

    async fn rpc(
        &self,
        src: &NodeId,
        dest: &NodeId,
        payload: Payload,
    ) -> Result<Payload, TransportError> {
        let msg_id = self.next_msg_id();
        let rx = self.register(src, msg_id);
        let request = Message::new(src.clone(), dest.clone(), Body::request(msg_id, payload));
        if let Err(error) = self.route(request) {
            self.pending.lock().remove(&(src.clone(), msg_id));
            return Err(error);
        }
        self.await_reply(src, dest, msg_id, rx).await
    }
}

/// One endpoint's view of a [`MemoryNetwork`].
///
/// Holds only a weak reference to the network, so nodes owning their
/// transport do not keep the network alive.
#[derive(Clone)]
pub struct MemoryTransport {
    id: NodeId,
    network: Weak<NetworkInner>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").field("id", &self.id).finish()
    }
}

impl MemoryTransport {
    fn network(&self) -> Result<Arc<NetworkInner>, TransportError> {
        self.network.upgrade().ok_or(TransportError::Closed)
    }
}

impl Transport for MemoryTransport {
    fn node_id(&self) -> NodeId {
        self.id.clone()
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.network
            .upgrade()
            .map(|network| network.node_ids.clone())
            .unwrap_or_default()
    }

    fn send<'a>(
        &'a self,
        dest: &'a NodeId,
        payload: Payload,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let message = Message::new(self.id.clone(), dest.clone(), Body::new(payload));
            self.network()?.route(message)
        })
    }

    fn rpc<'a>(
        &'a self,
        dest: &'a NodeId,
        payload: Payload,
    ) -> BoxFuture<'a, Result<Payload, TransportError>> {
        Box::pin(async move { self.network()?.rpc(&self.id, dest, payload).await })
    }

    fn reply<'a>(
        &'a self,
        request: &'a Message,
        payload: Payload,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if request.body.msg_id.is_none() {
                return Ok(());
            }
            self.network()?.route(request.reply(payload))
        })
    }
}

/// A fixed-membership cluster of broadcast nodes connected in memory.
///
/// Nodes are named `n1..=nN`. Any other identifier (e.g. `c1`) can act as a
/// client through [`MemoryNetwork::request`].
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("node_ids", &self.inner.node_ids)
            .field("rpc_timeout", &self.inner.rpc_timeout)
            .finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    /// Creates a cluster of `size` nodes with the default RPC timeout.
    #[must_use]
    pub fn new(size: usize, config: DisseminationConfig) -> Self {
        Self::with_rpc_timeout(size, config, DEFAULT_RPC_TIMEOUT)
    }

    /// Creates a cluster of `size` nodes.
    #[must_use]
    pub fn with_rpc_timeout(
        size: usize,
        config: DisseminationConfig,
        rpc_timeout: Duration,
    ) -> Self {
        let node_ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("n{i}"))).collect();
        let inner = Arc::new(NetworkInner {
            node_ids: node_ids.clone(),
            nodes: RwLock::new(HashMap::new()),
            links: Mutex::new(LinkState::default()),
            pending: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU64::new(1),
            rpc_timeout,
            handlers: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });

        let nodes = node_ids
            .into_iter()
            .map(|id| {
                let transport = Arc::new(MemoryTransport {
                    id: id.clone(),
                    network: Arc::downgrade(&inner),
                });
                let node = BroadcastNode::with_cancellation(
                    transport,
                    config.clone(),
                    inner.cancel.clone(),
                );
                (id, Arc::new(node))
            })
            .collect();
        *inner.nodes.write() = nodes;

        Self { inner }
    }

    /// Returns every node identifier.
    #[must_use]
    pub fn node_ids(&self) -> &[NodeId] {
        &self.inner.node_ids
    }

    /// Returns the node with the given identifier.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<Arc<BroadcastNode>> {
        self.inner.nodes.read().get(id).cloned()
    }

    /// Returns a transport for an endpoint outside the cluster.
    #[must_use]
    pub fn client(&self, id: &str) -> MemoryTransport {
        MemoryTransport {
            id: NodeId::from(id),
            network: Arc::downgrade(&self.inner),
        }
    }

    /// Sends a request from `client` to node `dest` and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown, the link is cut, or no reply
    /// arrives in time.
    pub async fn request(
        &self,
        client: &str,
        dest: &str,
        payload: Payload,
    ) -> Result<Payload, TransportError> {
        self.inner
            .rpc(&NodeId::from(client), &NodeId::from(dest), payload)
            .await
    }

    /// Sends an unvalidated JSON body from `client` to node `dest`.
    ///
    /// The body is validated on arrival the way a wire transport would do
    /// it; a body that fails validation is answered with an `error` reply.
    ///
    /// # Errors
    ///
    /// As [`MemoryNetwork::request`].
    pub async fn request_json(
        &self,
        client: &str,
        dest: &str,
        mut body: serde_json::Value,
    ) -> Result<Payload, TransportError> {
        let msg_id = self.inner.next_msg_id();
        if let Some(fields) = body.as_object_mut() {
            fields.insert("msg_id".to_string(), msg_id.into());
        }
        let raw = RawMessage {
            src: NodeId::from(client),
            dest: NodeId::from(dest),
            body,
        };

        let rx = self.inner.register(&raw.src, msg_id);
        let routed = match raw.clone().parse() {
            Ok(request) => self.inner.route(request),
            Err(error) => {
                debug!(src = %raw.src, error = %error, "rejecting malformed request");
                raw.error_reply(&error)
                    .map_or(Ok(()), |reply| self.inner.route(reply))
            }
        };
        if let Err(error) = routed {
            self.inner.pending.lock().remove(&(raw.src.clone(), msg_id));
            return Err(error);
        }
        self.inner.await_reply(&raw.src, &raw.dest, msg_id, rx).await
    }

    /// Cuts the link between two endpoints in both directions.
    pub fn cut(&self, a: &str, b: &str) {
        let (a, b) = (NodeId::from(a), NodeId::from(b));
        let mut links = self.inner.links.lock();
        links.cut.insert((a.clone(), b.clone()));
        links.cut.insert((b, a));
    }

    /// Cuts every link between `side` and the rest of the cluster.
    pub fn partition(&self, side: &[&str]) {
        let side: HashSet<NodeId> = side.iter().copied().map(NodeId::from).collect();
        let mut links = self.inner.links.lock();
        for inside in &side {
            for outside in self.inner.node_ids.iter().filter(|id| !side.contains(*id)) {
                links.cut.insert((inside.clone(), outside.clone()));
                links.cut.insert((outside.clone(), inside.clone()));
            }
        }
    }

    /// Cuts every link between `node` and the other nodes.
    pub fn isolate(&self, node: &str) {
        self.partition(&[node]);
    }

    /// Restores every link and clears injected failures.
    pub fn heal(&self) {
        let mut links = self.inner.links.lock();
        links.cut.clear();
        links.failures.clear();
    }

    /// Makes the next `count` messages from `src` to `dest` fail.
    pub fn fail_next(&self, src: &str, dest: &str, count: u32) {
        self.inner
            .links
            .lock()
            .failures
            .insert((NodeId::from(src), NodeId::from(dest)), count);
    }

    /// Returns how many requests `src` has tried to send to `dest`,
    /// including dropped ones.
    #[must_use]
    pub fn attempts(&self, src: &str, dest: &str) -> usize {
        self.count(src, dest, |_| true)
    }

    /// Returns how many requests from `src` actually reached `dest`.
    #[must_use]
    pub fn delivered(&self, src: &str, dest: &str) -> usize {
        self.count(src, dest, |attempt| attempt.delivered)
    }

    fn count(&self, src: &str, dest: &str, filter: impl Fn(&Attempt) -> bool) -> usize {
        self.inner
            .links
            .lock()
            .log
            .iter()
            .filter(|attempt| {
                attempt.request
                    && attempt.src.as_str() == src
                    && attempt.dest.as_str() == dest
                    && filter(attempt)
            })
            .count()
    }

    /// Returns the sorted values held by `node`.
    #[must_use]
    pub fn read(&self, node: &str) -> Vec<Value> {
        let mut values = self.node(node).map(|n| n.engine().read()).unwrap_or_default();
        values.sort_unstable();
        values
    }

    /// Waits until no handler or delivery task is running anywhere.
    ///
    /// Never returns while an origin delivery is retrying against a cut link.
    pub async fn settle(&self) {
        loop {
            let idle = self.inner.handlers.is_empty()
                && self
                    .inner
                    .nodes
                    .read()
                    .values()
                    .all(|node| node.engine().in_flight() == 0);
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stops every node and waits for all tasks to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let nodes: Vec<Arc<BroadcastNode>> = self.inner.nodes.read().values().cloned().collect();
        for node in nodes {
            node.shutdown().await;
        }
        self.inner.handlers.close();
        self.inner.handlers.wait().await;
    }
}
