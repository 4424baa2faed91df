//! Request dispatch for a broadcast node.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broadcast::{DisseminationConfig, Disseminator};
use crate::error::BroadcastError;
use crate::message::{Message, Payload};
use crate::transport::Transport;

/// A broadcast node: routes typed requests to the engine and answers them
/// through the transport.
pub struct BroadcastNode {
    transport: Arc<dyn Transport>,
    engine: Disseminator,
}

impl fmt::Debug for BroadcastNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastNode")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl BroadcastNode {
    /// Creates a node with its own shutdown token.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: DisseminationConfig) -> Self {
        Self::with_cancellation(transport, config, CancellationToken::new())
    }

    /// Creates a node stopped by a process-wide shutdown token.
    #[must_use]
    pub fn with_cancellation(
        transport: Arc<dyn Transport>,
        config: DisseminationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine: Disseminator::with_cancellation(Arc::clone(&transport), config, cancel),
            transport,
        }
    }

    /// Returns the dissemination engine.
    #[must_use]
    pub const fn engine(&self) -> &Disseminator {
        &self.engine
    }

    /// Handles one typed request and sends its reply, if any.
    ///
    /// Failed requests are answered with an `error` body when they carry a
    /// `msg_id`; engine state is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error only if a reply could not be handed to the transport.
    pub async fn handle(&self, request: Message) -> Result<(), BroadcastError> {
        match self.dispatch(&request) {
            Ok(Some(payload)) => self.transport.reply(&request, payload).await?,
            Ok(None) => {}
            Err(error) => {
                warn!(
                    src = %request.src,
                    kind = request.body.payload.kind(),
                    error = %error,
                    "request failed"
                );
                if request.body.msg_id.is_some() {
                    self.transport
                        .reply(&request, Payload::error(error.code(), error.to_string()))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Routes a request to the engine and returns the reply payload.
    ///
    /// Forwards are acknowledged only when sent as an RPC (they carry a
    /// `msg_id`); a fire-and-forget forward gets no reply.
    fn dispatch(&self, request: &Message) -> Result<Option<Payload>, BroadcastError> {
        match &request.body.payload {
            Payload::Broadcast { message } => {
                self.engine.handle_broadcast(*message);
                Ok(Some(Payload::BroadcastOk))
            }
            Payload::BroadcastForward { message } => {
                self.engine.handle_forward(*message, &request.src);
                Ok(request.body.msg_id.map(|_| Payload::BroadcastForwardOk))
            }
            Payload::Read => Ok(Some(Payload::ReadOk {
                messages: self.engine.read(),
            })),
            Payload::Topology { topology } => {
                self.engine.configure_topology(topology)?;
                Ok(Some(Payload::TopologyOk))
            }
            other => {
                debug!(
                    src = %request.src,
                    kind = other.kind(),
                    unsolicited_reply = other.is_reply(),
                    "unsupported request"
                );
                Err(BroadcastError::Unsupported(other.kind().to_string()))
            }
        }
    }

    /// Stops all in-flight deliveries and waits for them to exit.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
