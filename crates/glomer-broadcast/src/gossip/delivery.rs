//! Delivery of one value to one neighbor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::stats::DisseminationStats;
use crate::error::TransportError;
use crate::message::{MALFORMED_REQUEST, Payload};
use crate::protocol::{NodeId, Value};
use crate::transport::Transport;

/// Delivery policy of a propagation wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// First propagation of a value received from a client. Retries each
    /// neighbor until it acknowledges.
    Origin,
    /// Propagation of a value received from a peer. One attempt per neighbor.
    Relay,
}

impl Propagation {
    /// Returns true if failed attempts are retried.
    #[must_use]
    pub const fn retries(self) -> bool {
        matches!(self, Self::Origin)
    }

    /// Returns the policy name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a delivery task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The neighbor acknowledged the value.
    Delivered {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// A relay attempt failed and was not retried.
    Abandoned {
        /// Attempts made (always one).
        attempts: u32,
    },
    /// Shutdown stopped the delivery before it succeeded.
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl DeliveryOutcome {
    /// Returns the number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts }
            | Self::Abandoned { attempts }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Returns true if the value reached the neighbor.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// One pending delivery: a (value, neighbor, policy) triple and the handles it needs.
///
/// Owned by the task that runs it and dropped when the task ends.
pub(crate) struct Delivery {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) neighbor: NodeId,
    pub(crate) value: Value,
    pub(crate) propagation: Propagation,
    pub(crate) retry_interval: Duration,
    /// Relay attempts use an RPC when set, a plain send otherwise.
    pub(crate) relay_expects_reply: bool,
    pub(crate) cancel: CancellationToken,
    pub(crate) stats: Arc<DisseminationStats>,
}

impl Delivery {
    /// Runs the delivery until it succeeds, is abandoned, or is cancelled.
    pub(crate) async fn run(self) -> DeliveryOutcome {
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(DeliveryOutcome::Cancelled { attempts });
            }

            attempts += 1;
            self.stats.record_attempt();

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return self.finish(DeliveryOutcome::Cancelled { attempts });
                }
                result = self.attempt() => result,
            };

            let error = match result {
                Ok(()) => {
                    trace!(
                        value = self.value,
                        neighbor = %self.neighbor,
                        attempts,
                        policy = %self.propagation,
                        "delivered"
                    );
                    return self.finish(DeliveryOutcome::Delivered { attempts });
                }
                Err(error) => error,
            };

            if !self.propagation.retries() {
                debug!(
                    value = self.value,
                    neighbor = %self.neighbor,
                    error = %error,
                    "relay delivery failed, abandoning"
                );
                return self.finish(DeliveryOutcome::Abandoned { attempts });
            }

            warn!(
                value = self.value,
                neighbor = %self.neighbor,
                attempt = attempts,
                error = %error,
                retry_in_ms = self.retry_interval.as_millis() as u64,
                "origin delivery failed, retrying"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return self.finish(DeliveryOutcome::Cancelled { attempts });
                }
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Makes a single attempt to hand the value to the neighbor.
    async fn attempt(&self) -> Result<(), TransportError> {
        let payload = Payload::BroadcastForward {
            message: self.value,
        };

        if self.propagation == Propagation::Relay && !self.relay_expects_reply {
            return self.transport.send(&self.neighbor, payload).await;
        }

        match self.transport.rpc(&self.neighbor, payload).await? {
            Payload::BroadcastForwardOk => Ok(()),
            Payload::Error { code, text } => Err(TransportError::Rejected {
                dest: self.neighbor.clone(),
                code,
                text,
            }),
            other => Err(TransportError::Rejected {
                dest: self.neighbor.clone(),
                code: MALFORMED_REQUEST,
                text: format!("unexpected reply type {}", other.kind()),
            }),
        }
    }

    fn finish(&self, outcome: DeliveryOutcome) -> DeliveryOutcome {
        if let DeliveryOutcome::Cancelled { attempts } = outcome {
            debug!(
                value = self.value,
                neighbor = %self.neighbor,
                attempts,
                "delivery cancelled by shutdown"
            );
        }
        self.stats.record_outcome(outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::transport::BoxFuture;
    use parking_lot::Mutex;

    /// Transport whose RPCs fail a fixed number of times before succeeding.
    #[derive(Default)]
    struct ScriptedTransport {
        failures_left: Mutex<u32>,
        rpcs: Mutex<u32>,
        sends: Mutex<u32>,
        reply: Mutex<Option<Payload>>,
    }

    impl ScriptedTransport {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(times),
                ..Self::default()
            })
        }

        fn replying(payload: Payload) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(payload)),
                ..Self::default()
            })
        }

        fn rpcs(&self) -> u32 {
            *self.rpcs.lock()
        }

        fn sends(&self) -> u32 {
            *self.sends.lock()
        }
    }

    impl Transport for ScriptedTransport {
        fn node_id(&self) -> NodeId {
            "n1".into()
        }

        fn node_ids(&self) -> Vec<NodeId> {
            vec!["n1".into(), "n2".into()]
        }

        fn send<'a>(
            &'a self,
            _dest: &'a NodeId,
            _payload: Payload,
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            *self.sends.lock() += 1;
            Box::pin(async { Ok(()) })
        }

        fn rpc<'a>(
            &'a self,
            dest: &'a NodeId,
            _payload: Payload,
        ) -> BoxFuture<'a, Result<Payload, TransportError>> {
            *self.rpcs.lock() += 1;
            let fail = {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    true
                } else {
                    false
                }
            };
            let reply = self.reply.lock().clone();
            Box::pin(async move {
                if fail {
                    return Err(TransportError::Unreachable { dest: dest.clone() });
                }
                Ok(reply.unwrap_or(Payload::BroadcastForwardOk))
            })
        }

        fn reply<'a>(
            &'a self,
            _request: &'a Message,
            _payload: Payload,
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn delivery(
        transport: Arc<ScriptedTransport>,
        propagation: Propagation,
        cancel: CancellationToken,
    ) -> (Delivery, Arc<DisseminationStats>) {
        let stats = Arc::new(DisseminationStats::new());
        let delivery = Delivery {
            transport,
            neighbor: "n2".into(),
            value: 7,
            propagation,
            retry_interval: Duration::from_secs(1),
            relay_expects_reply: true,
            cancel,
            stats: Arc::clone(&stats),
        };
        (delivery, stats)
    }

    // ========== Origin ==========

    #[tokio::test(start_paused = true)]
    async fn origin_retries_until_success() {
        let transport = ScriptedTransport::failing(3);
        let (delivery, stats) = delivery(
            Arc::clone(&transport),
            Propagation::Origin,
            CancellationToken::new(),
        );

        let started = tokio::time::Instant::now();
        let outcome = delivery.run().await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 4 });
        assert_eq!(transport.rpcs(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
        assert_eq!(stats.snapshot().attempts, 4);
        assert_eq!(stats.snapshot().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn origin_treats_error_reply_as_failure() {
        let transport = ScriptedTransport::replying(Payload::error(13, "busy"));
        let cancel = CancellationToken::new();
        let (delivery, _stats) =
            delivery(Arc::clone(&transport), Propagation::Origin, cancel.clone());

        let handle = tokio::spawn(delivery.run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();

        let outcome = handle.await.expect("task panicked");
        assert_eq!(outcome, DeliveryOutcome::Cancelled { attempts: 3 });
        assert_eq!(transport.rpcs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn origin_stops_at_retry_boundary_on_cancel() {
        let transport = ScriptedTransport::failing(u32::MAX);
        let cancel = CancellationToken::new();
        let (delivery, stats) =
            delivery(Arc::clone(&transport), Propagation::Origin, cancel.clone());

        let handle = tokio::spawn(delivery.run());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();

        let outcome = handle.await.expect("task panicked");
        assert_eq!(outcome, DeliveryOutcome::Cancelled { attempts: 2 });
        assert_eq!(stats.snapshot().cancelled, 1);

        // No attempts once cancelled.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.rpcs(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_attempt() {
        let transport = ScriptedTransport::failing(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (delivery, _stats) = delivery(Arc::clone(&transport), Propagation::Origin, cancel);

        let outcome = delivery.run().await;

        assert_eq!(outcome, DeliveryOutcome::Cancelled { attempts: 0 });
        assert_eq!(transport.rpcs(), 0);
    }

    // ========== Relay ==========

    #[tokio::test(start_paused = true)]
    async fn relay_abandons_after_one_failure() {
        let transport = ScriptedTransport::failing(1);
        let (delivery, stats) = delivery(
            Arc::clone(&transport),
            Propagation::Relay,
            CancellationToken::new(),
        );

        let outcome = delivery.run().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(outcome, DeliveryOutcome::Abandoned { attempts: 1 });
        assert_eq!(transport.rpcs(), 1);
        assert_eq!(stats.snapshot().abandoned, 1);
    }

    #[tokio::test]
    async fn relay_without_reply_uses_send() {
        let transport = ScriptedTransport::failing(0);
        let (mut delivery, _stats) = delivery(
            Arc::clone(&transport),
            Propagation::Relay,
            CancellationToken::new(),
        );
        delivery.relay_expects_reply = false;

        let outcome = delivery.run().await;

        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(transport.sends(), 1);
        assert_eq!(transport.rpcs(), 0);
    }

    #[test]
    fn propagation_policy_names() {
        assert!(Propagation::Origin.retries());
        assert!(!Propagation::Relay.retries());
        assert_eq!(Propagation::Relay.to_string(), "relay");
    }
}
