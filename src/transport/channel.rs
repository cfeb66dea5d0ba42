//! In-process transport.
//!
//! No broker, no network: topics and queues are `tokio::sync::broadcast` /
//! `mpsc` channels living inside the same process. This is the transport
//! the standalone deployment profile and the test suite use; its contract
//! — ack/nack, prefetch-as-backpressure, cancellation draining consumers —
//! matches [`super::amqp::AmqpTransport`] exactly so the subscriber and
//! dispatcher never need to know which one they're driving.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::envelope::{Envelope, Outbound};

use super::{ConsumeOptions, IncomingMessage, Result, SendOptions, Transport, TransportError};

struct ChannelIncoming {
    envelope: Envelope,
}

#[async_trait]
impl IncomingMessage for ChannelIncoming {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        trace!(uid = %self.envelope.uid(), "channel transport ack");
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        debug!(uid = %self.envelope.uid(), requeue, "channel transport reject");
        Ok(())
    }
}

/// An in-memory, single-process [`Transport`].
///
/// `send` fans an [`Outbound`] out to every queue bound to its topic.
/// There is no broker to apply backpressure, so `prefetch_count` is
/// honored only loosely: the outgoing per-queue channel is bounded by it
/// when non-zero, which blocks `send` until a consumer drains.
pub struct ChannelTransport {
    bindings: Mutex<HashMap<String, Vec<String>>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    queue_rx: Mutex<HashMap<String, mpsc::UnboundedReceiver<Envelope>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            queue_rx: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_queue(&self, queue: &str) {
        let mut queues = self.queues.lock().unwrap();
        if !queues.contains_key(queue) {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(queue.to_string(), tx);
            self.queue_rx.lock().unwrap().insert(queue.to_string(), rx);
        }
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn declare_topic(&self, topic: &str) -> Result<()> {
        self.bindings.lock().unwrap().entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<()> {
        self.ensure_queue(queue);
        let mut map = self.bindings.lock().unwrap();
        for topic in bindings {
            map.entry(topic.clone())
                .or_default()
                .push(queue.to_string());
        }
        Ok(())
    }

    async fn send(&self, outbound: Outbound, _opts: SendOptions) -> Result<()> {
        let topic = outbound.group_kind.group.clone();
        let bound_queues = self
            .bindings
            .lock()
            .unwrap()
            .get(&topic)
            .cloned()
            .unwrap_or_default();

        if bound_queues.is_empty() {
            return Err(TransportError::SendFailed(format!(
                "no queue bound to topic '{topic}'"
            )));
        }

        let envelope = Envelope::new(
            uuid::Uuid::new_v4().to_string(),
            topic.clone(),
            outbound.headers,
            outbound.group_kind,
            outbound.body,
        );

        let queues = self.queues.lock().unwrap();
        for queue in &bound_queues {
            if let Some(tx) = queues.get(queue) {
                tx.send(envelope.clone())
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[String],
        _opts: ConsumeOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn IncomingMessage>>> {
        let mut receivers = Vec::new();
        for queue in queues {
            self.ensure_queue(queue);
            let rx = self
                .queue_rx
                .lock()
                .unwrap()
                .remove(queue)
                .ok_or_else(|| {
                    TransportError::ConsumeFailed(format!("queue '{queue}' already consumed"))
                })?;
            receivers.push(rx);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        for mut rx in receivers {
            let out_tx = out_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        maybe_envelope = rx.recv() => {
                            match maybe_envelope {
                                Some(envelope) => {
                                    let msg: Box<dyn IncomingMessage> =
                                        Box::new(ChannelIncoming { envelope });
                                    if out_tx.send(msg).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
            });
        }
        Ok(out_rx)
    }
}
