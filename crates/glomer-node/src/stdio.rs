//! Newline-delimited JSON runtime over a byte stream.
//!
//! The runtime reads one message envelope per line. `init` assigns the node
//! identity; replies (`in_reply_to`) complete pending RPCs; every other
//! request is handed to a [`BroadcastNode`] on its own task. All output goes
//! through a single writer task so lines are never interleaved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use glomer_broadcast::message::MALFORMED_REQUEST;
use glomer_broadcast::{
    Body, BoxFuture, BroadcastError, BroadcastNode, Message, NodeId, Payload, RawMessage,
    StatsSnapshot, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::NodeResult;

#[derive(Debug)]
struct Identity {
    node_id: NodeId,
    node_ids: Vec<NodeId>,
}

/// [`Transport`] that writes messages as JSON lines.
#[derive(Debug)]
pub struct StdioTransport {
    identity: OnceLock<Identity>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Payload>>>,
    next_msg_id: AtomicU64,
    rpc_timeout: Duration,
}

impl StdioTransport {
    /// Creates a transport feeding `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<Message>, rpc_timeout: Duration) -> Self {
        Self {
            identity: OnceLock::new(),
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU64::new(1),
            rpc_timeout,
        }
    }

    /// Records the identity assigned by `init`.
    ///
    /// Returns false if the node was already initialized; the first
    /// identity is kept.
    pub fn initialize(&self, node_id: NodeId, node_ids: Vec<NodeId>) -> bool {
        self.identity.set(Identity { node_id, node_ids }).is_ok()
    }

    /// Returns true once `init` has been handled.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.identity.get().is_some()
    }

    /// Completes the RPC waiting on `in_reply_to`.
    ///
    /// Returns false if no RPC was waiting (it may have timed out).
    pub fn complete(&self, in_reply_to: u64, payload: Payload) -> bool {
        match self.pending.lock().remove(&in_reply_to) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Queues a message for the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`StdioTransport::close`].
    pub fn write(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .lock()
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Stops accepting output; the writer task drains and exits.
    pub fn close(&self) {
        self.outbound.lock().take();
    }

    /// Returns the number of RPCs waiting for a reply.
    #[must_use]
    pub fn pending_rpcs(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Transport for StdioTransport {
    fn node_id(&self) -> NodeId {
        self.identity
            .get()
            .map_or_else(|| NodeId::new(String::new()), |identity| identity.node_id.clone())
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.identity
            .get()
            .map(|identity| identity.node_ids.clone())
            .unwrap_or_default()
    }

    fn send<'a>(
        &'a self,
        dest: &'a NodeId,
        payload: Payload,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.write(Message::new(self.node_id(), dest.clone(), Body::new(payload)))
        })
    }

    fn rpc<'a>(
        &'a self,
        dest: &'a NodeId,
        payload: Payload,
    ) -> BoxFuture<'a, Result<Payload, TransportError>> {
        Box::pin(async move {
            let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(msg_id, tx);

            let request =
                Message::new(self.node_id(), dest.clone(), Body::request(msg_id, payload));
            if let Err(error) = self.write(request) {
                self.pending.lock().remove(&msg_id);
                return Err(error);
            }

            match tokio::time::timeout(self.rpc_timeout, rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(TransportError::Closed),
                Err(_) => {
                    self.pending.lock().remove(&msg_id);
                    Err(TransportError::Timeout { dest: dest.clone() })
                }
            }
        })
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
            self.write(request.reply(payload))
        })
    }
}

async fn write_loop<W>(mut rx: mpsc::UnboundedReceiver<Message>, mut writer: W) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = message.to_json()?;
        trace!(%line, "out");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Runs a broadcast node over a line-oriented reader and writer.
///
/// Returns when the input ends or `cancel` fires, after every delivery and
/// handler task has exited and all output has been flushed.
///
/// # Errors
///
/// Returns an error if reading the input or writing the output fails.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    config: &NodeConfig,
    cancel: CancellationToken,
) -> NodeResult<StatsSnapshot>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(rx, writer));

    let transport = Arc::new(StdioTransport::new(tx, config.rpc_timeout()));
    let node = Arc::new(BroadcastNode::with_cancellation(
        Arc::clone(&transport) as Arc<dyn Transport>,
        config.dissemination(),
        cancel.clone(),
    ));
    let handlers = TaskTracker::new();

    let mut lines = reader.lines();
    let read_result = loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("shutdown requested");
                break Ok(());
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => dispatch_line(&line, &transport, &node, &handlers),
            Ok(None) => {
                info!("input closed");
                break Ok(());
            }
            Err(error) => break Err(error),
        }
    };

    cancel.cancel();
    node.shutdown().await;
    handlers.close();
    handlers.wait().await;

    let stats = node.engine().stats();
    transport.close();
    match writer.await {
        Ok(result) => result?,
        Err(error) => warn!(error = %error, "writer task failed"),
    }
    read_result?;

    Ok(stats)
}

fn dispatch_line(
    line: &str,
    transport: &Arc<StdioTransport>,
    node: &Arc<BroadcastNode>,
    handlers: &TaskTracker,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    trace!(%line, "in");

    let raw = match RawMessage::from_json(line) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(error = %error, "dropping undecodable line");
            return;
        }
    };

    if let Some(in_reply_to) = raw.in_reply_to() {
        let payload = match Body::from_value(raw.body) {
            Ok(body) => body.payload,
            Err(error) => Payload::error(MALFORMED_REQUEST, error.to_string()),
        };
        if !transport.complete(in_reply_to, payload) {
            debug!(src = %raw.src, in_reply_to, "late or unknown reply dropped");
        }
        return;
    }

    let request = match raw.clone().parse() {
        Ok(request) => request,
        Err(error) => {
            warn!(src = %raw.src, error = %error, "rejecting request");
            if let Some(reply) = raw.error_reply(&error) {
                write_or_log(transport, reply);
            }
            return;
        }
    };

    if let Payload::Init { node_id, node_ids } = &request.body.payload {
        let reply = if transport.initialize(node_id.clone(), node_ids.clone()) {
            info!(node_id = %node_id, nodes = node_ids.len(), "initialized");
            Payload::InitOk
        } else {
            warn!(node_id = %node_id, "ignoring repeated init");
            Payload::error(
                MALFORMED_REQUEST,
                format!("already initialized as {}", transport.node_id()),
            )
        };
        write_or_log(transport, request.reply(reply));
        return;
    }

    if !transport.is_initialized() {
        let error = BroadcastError::NotInitialized;
        warn!(src = %request.src, kind = request.body.payload.kind(), "request before init");
        if request.body.msg_id.is_some() {
            write_or_log(
                transport,
                request.reply(Payload::error(error.code(), error.to_string())),
            );
        }
        return;
    }

    debug!(
        src = %request.src,
        client = request.src.is_client(),
        kind = request.body.payload.kind(),
        "dispatching request"
    );
    let node = Arc::clone(node);
    handlers.spawn(async move {
        if let Err(error) = node.handle(request).await {
            warn!(error = %error, "failed to reply");
        }
    });
}

fn write_or_log(transport: &StdioTransport, message: Message) {
    if let Err(error) = transport.write(message) {
        warn!(error = %error, "failed to queue reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glomer_broadcast::message::TEMPORARILY_UNAVAILABLE;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream, duplex};
    use tokio::task::JoinHandle;

    // ========== Harness ==========

    struct Harness {
        input: DuplexStream,
        output: BufReader<DuplexStream>,
        cancel: CancellationToken,
        server: JoinHandle<NodeResult<StatsSnapshot>>,
    }

    impl Harness {
        fn start(config: NodeConfig) -> Self {
            let (input, server_in) = duplex(64 * 1024);
            let (server_out, output) = duplex(64 * 1024);
            let cancel = CancellationToken::new();
            let server = tokio::spawn({
                let cancel = cancel.clone();
                async move { serve(BufReader::new(server_in), server_out, &config, cancel).await }
            });
            Self {
                input,
                output: BufReader::new(output),
                cancel,
                server,
            }
        }

        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.input.write_all(line.as_bytes()).await.expect("write");
        }

        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.output.read_line(&mut line).await.expect("read");
            serde_json::from_str(&line).expect("json line")
        }

        async fn init(&mut self, node_id: &str, node_ids: &[&str]) {
            self.send(json!({
                "src": "c0", "dest": node_id,
                "body": {"type": "init", "msg_id": 1, "node_id": node_id, "node_ids": node_ids}
            }))
            .await;
            let reply = self.recv().await;
            assert_eq!(reply["body"]["type"], "init_ok");
        }

        async fn finish(self) -> StatsSnapshot {
            drop(self.input);
            let mut output = self.output;
            let mut rest = String::new();
            output.read_to_string(&mut rest).await.expect("drain");
            self.server.await.expect("join").expect("serve")
        }
    }

    // ========== Handshake ==========

    #[tokio::test]
    async fn init_is_acknowledged() {
        let mut node = Harness::start(NodeConfig::default());
        node.send(json!({
            "src": "c0", "dest": "n1",
            "body": {"type": "init", "msg_id": 7, "node_id": "n1", "node_ids": ["n1"]}
        }))
        .await;

        let reply = node.recv().await;
        assert_eq!(
            reply,
            json!({"src": "n1", "dest": "c0", "body": {"type": "init_ok", "in_reply_to": 7}})
        );
        node.finish().await;
    }

    #[tokio::test]
    async fn requests_before_init_are_unavailable() {
        let mut node = Harness::start(NodeConfig::default());
        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "read", "msg_id": 2}}))
            .await;

        let reply = node.recv().await;
        assert_eq!(reply["body"]["type"], "error");
        assert_eq!(reply["body"]["code"], TEMPORARILY_UNAVAILABLE);
        assert_eq!(reply["body"]["in_reply_to"], 2);
        node.finish().await;
    }

    // ========== Client requests ==========

    #[tokio::test]
    async fn broadcast_then_read() {
        let mut node = Harness::start(NodeConfig::default());
        node.init("n1", &["n1"]).await;

        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 2, "message": 42}}))
            .await;
        let ack = node.recv().await;
        assert_eq!(ack["body"], json!({"type": "broadcast_ok", "in_reply_to": 2}));

        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "read", "msg_id": 3}}))
            .await;
        let read = node.recv().await;
        assert_eq!(read["body"]["type"], "read_ok");
        assert_eq!(read["body"]["messages"], json!([42]));

        let stats = node.finish().await;
        assert_eq!(stats.origin_waves, 1);
        assert_eq!(stats.stored_values, 1);
    }

    #[tokio::test]
    async fn malformed_request_gets_error_reply() {
        let mut node = Harness::start(NodeConfig::default());
        node.init("n1", &["n1"]).await;

        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 5, "message": "x"}}))
            .await;
        let reply = node.recv().await;
        assert_eq!(reply["body"]["type"], "error");
        assert_eq!(reply["body"]["code"], MALFORMED_REQUEST);
        assert_eq!(reply["body"]["in_reply_to"], 5);
        node.finish().await;
    }

    #[tokio::test]
    async fn repeated_init_keeps_first_identity() {
        let mut node = Harness::start(NodeConfig::default());
        node.init("n1", &["n1", "n2"]).await;

        node.send(json!({
            "src": "c0", "dest": "n1",
            "body": {"type": "init", "msg_id": 2, "node_id": "n2", "node_ids": ["n1", "n2"]}
        }))
        .await;
        let reply = node.recv().await;
        assert_eq!(reply["body"]["type"], "error");
        assert_eq!(reply["src"], "n1");
        node.finish().await;
    }

    // ========== Peer traffic ==========

    #[tokio::test]
    async fn forward_is_acknowledged_and_not_echoed_to_sender() {
        let mut node = Harness::start(NodeConfig::default());
        node.init("n1", &["n1", "n2"]).await;

        node.send(json!({"src": "n2", "dest": "n1", "body": {"type": "broadcast_forward", "msg_id": 9, "message": 3}}))
            .await;
        let ack = node.recv().await;
        assert_eq!(ack["dest"], "n2");
        assert_eq!(ack["body"], json!({"type": "broadcast_forward_ok", "in_reply_to": 9}));

        let stats = node.finish().await;
        assert_eq!(stats.relay_waves, 1);
        assert_eq!(stats.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn origin_delivery_completes_on_reply() {
        let mut node = Harness::start(NodeConfig::default());
        node.init("n1", &["n1", "n2"]).await;

        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 2, "message": 8}}))
            .await;

        let mut forward = None;
        for _ in 0..2 {
            let line = node.recv().await;
            if line["body"]["type"] == "broadcast_forward" {
                forward = Some(line);
            }
        }
        let forward = forward.expect("forward to n2");
        assert_eq!(forward["dest"], "n2");
        assert_eq!(forward["body"]["message"], 8);

        let msg_id = forward["body"]["msg_id"].clone();
        node.send(json!({"src": "n2", "dest": "n1", "body": {"type": "broadcast_forward_ok", "in_reply_to": msg_id}}))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = node.finish().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_origin_delivery_is_retried() {
        let config = NodeConfig {
            rpc_timeout_ms: 100,
            retry_interval_ms: 100,
            ..NodeConfig::default()
        };
        let mut node = Harness::start(config);
        node.init("n1", &["n1", "n2"]).await;

        node.send(json!({"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 2, "message": 8}}))
            .await;

        let mut forwards = Vec::new();
        while forwards.len() < 3 {
            let line = node.recv().await;
            if line["body"]["type"] == "broadcast_forward" {
                forwards.push(line["body"]["msg_id"].as_u64().expect("msg_id"));
            }
        }
        forwards.dedup();
        assert_eq!(forwards.len(), 3, "each attempt uses a fresh msg_id");

        node.cancel.cancel();
        let stats = node.finish().await;
        assert!(stats.attempts >= 3);
        assert_eq!(stats.cancelled, 1);
    }

    // ========== Transport ==========

    #[tokio::test(start_paused = true)]
    async fn rpc_times_out_and_forgets_pending_entry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new(tx, Duration::from_millis(50));
        transport.initialize("n1".into(), vec!["n1".into(), "n2".into()]);

        let result = transport.rpc(&"n2".into(), Payload::Read).await;

        assert!(matches!(result, Err(TransportError::Timeout { dest }) if dest.as_str() == "n2"));
        assert_eq!(transport.pending_rpcs(), 0);
        let sent = rx.recv().await.expect("request written");
        assert_eq!(sent.body.msg_id, Some(1));
    }

    #[tokio::test]
    async fn closed_transport_rejects_output() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new(tx, Duration::from_secs(1));
        transport.close();

        let result = transport.send(&"n2".into(), Payload::Read).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn reply_to_notification_writes_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new(tx, Duration::from_secs(1));
        let request = Message::new(
            "n2".into(),
            "n1".into(),
            Body::new(Payload::BroadcastForward { message: 1 }),
        );

        tokio_test::assert_ok!(tokio_test::block_on(
            transport.reply(&request, Payload::BroadcastForwardOk)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reply_without_pending_rpc_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new(tx, Duration::from_secs(1));
        assert!(!transport.complete(4, Payload::BroadcastForwardOk));
    }
}
