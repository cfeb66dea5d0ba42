//! AMQP (RabbitMQ) transport.
//!
//! Each `group` in a [`crate::envelope::GroupKind`] maps to a topic
//! exchange; `declare_queue` binds a queue to one or more of those
//! exchanges with a `#` routing key, since routing within a group is the
//! [`crate::router::EndpointRouter`]'s job, not the broker's.

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::envelope::{Envelope, GroupKind, Headers, Outbound, CONTENT_TYPE_HEADER};

use super::{ConsumeOptions, IncomingMessage, Result, SendOptions, Transport, TransportError};

/// Connection settings for the AMQP transport.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    pub url: String,
    pub pool_size: usize,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
        }
    }
}

/// RabbitMQ-backed [`Transport`].
pub struct AmqpTransport {
    pool: Pool,
}

impl AmqpTransport {
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        // Verify connectivity eagerly rather than on first use.
        let _ = pool
            .get()
            .await
            .map_err(|e: PoolError| TransportError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn channel(&self) -> Result<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        conn.create_channel()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

struct AmqpIncoming {
    envelope: Envelope,
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl IncomingMessage for AmqpIncoming {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::AckFailed(e.to_string()))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::AckFailed(e.to_string()))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<()> {
        let _ = self.channel().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn declare_topic(&self, topic: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                topic,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        for topic in bindings {
            channel
                .queue_bind(
                    queue,
                    topic,
                    "#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    async fn send(&self, outbound: Outbound, opts: SendOptions) -> Result<()> {
        let channel = self.channel().await?;
        let payload = serde_json::to_vec(&outbound.body)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_HEADER.into())
            .with_delivery_mode(2)
            .with_kind(outbound.group_kind.kind.clone().into());

        if let Some(uid) = outbound.headers.get(crate::envelope::SAGA_UID_HEADER) {
            properties = properties.with_app_id(uid.to_string().into());
        }

        let mut publish_opts = BasicPublishOptions::default();
        publish_opts.mandatory = opts.mandatory;
        publish_opts.immediate = opts.immediate;

        let routing_key = outbound.group_kind.kind.clone();
        channel
            .basic_publish(
                &outbound.group_kind.group,
                &routing_key,
                publish_opts,
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        debug!(exchange = %outbound.group_kind.group, routing_key = %routing_key, "published message");
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[String],
        opts: ConsumeOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn IncomingMessage>>> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        for queue in queues {
            let channel = self.channel().await?;
            if opts.prefetch_count > 0 {
                channel
                    .basic_qos(opts.prefetch_count, Default::default())
                    .await
                    .map_err(|e| TransportError::ConsumeFailed(e.to_string()))?;
            }

            let mut consumer = channel
                .basic_consume(
                    queue,
                    "saga-engine",
                    BasicConsumeOptions {
                        no_local: opts.no_local,
                        no_wait: opts.no_wait,
                        exclusive: opts.exclusive,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::ConsumeFailed(e.to_string()))?;

            let out_tx = out_tx.clone();
            let cancel = cancel.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = consumer.next() => {
                            let Some(delivery) = next else { break };
                            let delivery = match delivery {
                                Ok(d) => d,
                                Err(e) => {
                                    error!(error = %e, queue = %queue, "consumer error");
                                    continue;
                                }
                            };
                            let envelope = match decode_delivery(&delivery, &queue) {
                                Ok(e) => e,
                                Err(e) => {
                                    warn!(error = %e, queue = %queue, "malformed delivery, rejecting");
                                    let _ = delivery.reject(BasicRejectOptions::default()).await;
                                    continue;
                                }
                            };
                            let msg: Box<dyn IncomingMessage> =
                                Box::new(AmqpIncoming { envelope, delivery });
                            if out_tx.send(msg).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok(out_rx)
    }
}

fn decode_delivery(
    delivery: &lapin::message::Delivery,
    queue: &str,
) -> std::result::Result<Envelope, String> {
    let body: serde_json::Value =
        serde_json::from_slice(&delivery.data).map_err(|e| e.to_string())?;

    let kind = delivery
        .properties
        .kind()
        .clone()
        .map(|k| k.to_string())
        .unwrap_or_default();

    let mut headers = Headers::new();
    if let Some(table) = delivery.properties.headers() {
        for (k, v) in table.into_iter() {
            headers.insert(k.as_str(), v.to_string());
        }
    }
    if let Some(app_id) = delivery.properties.app_id() {
        headers.insert(crate::envelope::SAGA_UID_HEADER, app_id.to_string());
    }

    Ok(Envelope::new(
        delivery.delivery_tag.to_string(),
        queue.to_string(),
        headers,
        GroupKind::new(delivery.exchange.to_string(), kind),
        body,
    ))
}
