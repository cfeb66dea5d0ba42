//! Broker-agnostic transport abstraction.
//!
//! [`Transport`] is the seam between the saga engine and whatever message
//! bus actually ships bytes around. `channel` (default) is an in-process,
//! dependency-free implementation for standalone use and tests; `amqp`
//! (feature-gated) talks to RabbitMQ via `lapin`.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, Outbound};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpTransport};
pub use channel::ChannelTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors a transport implementation can raise.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("consume failed: {0}")]
    ConsumeFailed(String),

    #[error("acknowledgement failed: {0}")]
    AckFailed(String),
}

/// Options governing how a queue is consumed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Maximum unacked messages the broker will deliver at once. The
    /// subscriber sets this to the dispatcher's worker count so the broker
    /// never hands out more in-flight work than there are workers.
    pub prefetch_count: u16,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

impl ConsumeOptions {
    pub fn with_prefetch(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            ..Default::default()
        }
    }
}

/// Options governing how a single message is published.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// A message pulled off the transport, not yet acknowledged.
///
/// Ownership of `self` is required to ack/reject, so a message can't be
/// acknowledged twice by accident — the caller gives it up in the act of
/// resolving it.
#[async_trait]
pub trait IncomingMessage: Send {
    fn envelope(&self) -> &Envelope;

    /// Acknowledge: the broker will not redeliver this message.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negative-acknowledge. `requeue` asks the broker to redeliver;
    /// `false` is used for messages that can never succeed (e.g. a
    /// decode failure on an empty `kind`).
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// Broker-agnostic produce/consume primitives.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Idempotent: connecting an already-connected transport is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Idempotent: disconnecting an already-disconnected transport is a
    /// no-op.
    async fn disconnect(&self) -> Result<()>;

    async fn declare_topic(&self, topic: &str) -> Result<()>;

    async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<()>;

    /// Publishes a single message, returning once the broker has accepted
    /// it (or confirmed, if the backend offers confirms).
    async fn send(&self, outbound: Outbound, opts: SendOptions) -> Result<()>;

    /// Returns a lazy, unbounded channel of incoming messages for
    /// `queues`. Cancelling `cancel` terminates all per-queue consumers
    /// and closes the channel once they drain.
    async fn consume(
        &self,
        queues: &[String],
        opts: ConsumeOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn IncomingMessage>>>;
}
