//! Endpoint Router — the outgoing side of the message fabric.
//!
//! A saga turn doesn't know or care which transport carries its outgoing
//! messages; it builds an [`Outbound`] and asks the router to fan it out
//! to every [`Endpoint`] registered for that payload's `(group, kind)`.
//! Registering the same name twice under a key replaces, not duplicates,
//! the registration — mirroring the registry's idempotent `register`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::error;

use crate::envelope::{GroupKind, Outbound};
use crate::transport::{SendOptions, Transport, TransportError};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no endpoint registered for {0}")]
    NoEndpoint(GroupKind),

    #[error("endpoint '{endpoint}' failed: {source}")]
    EndpointFailed {
        endpoint: String,
        #[source]
        source: TransportError,
    },
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// A named destination an [`Outbound`] payload can be sent to.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, outbound: &Outbound) -> std::result::Result<(), TransportError>;
}

/// An [`Endpoint`] that publishes through a [`Transport`], translating
/// [`crate::envelope::DeliveryOptions`] into transport headers — a delay
/// becomes a header the broker-specific producer can turn into a
/// per-message TTL/dead-letter hop, since the `Transport` trait itself
/// has no notion of delay.
pub struct TransportEndpoint {
    name: String,
    transport: Arc<dyn Transport>,
}

impl TransportEndpoint {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }
}

#[async_trait]
impl Endpoint for TransportEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, outbound: &Outbound) -> std::result::Result<(), TransportError> {
        let mut outbound = outbound.clone();
        if let Some(delay) = outbound.options.delay {
            outbound
                .headers
                .insert("x-delay-ms", delay.as_millis().to_string());
        }
        let opts = SendOptions {
            mandatory: outbound.options.mandatory,
            immediate: outbound.options.immediate,
        };
        self.transport.send(outbound, opts).await
    }
}

/// Routes outgoing payloads, by `(group, kind)`, to zero or more
/// registered [`Endpoint`]s.
#[derive(Clone, Default)]
pub struct EndpointRouter {
    routes: Arc<RwLock<HashMap<GroupKind, Vec<Arc<dyn Endpoint>>>>>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` for `key`. Re-registering the same endpoint
    /// name under the same key replaces the earlier registration rather
    /// than delivering twice.
    pub async fn register(&self, key: GroupKind, endpoint: Arc<dyn Endpoint>) {
        let mut routes = self.routes.write().await;
        let entries = routes.entry(key).or_default();
        entries.retain(|e| e.name() != endpoint.name());
        entries.push(endpoint);
    }

    /// Fans `outbound` out to every endpoint registered for its
    /// `(group, kind)`. A send failure on one endpoint does not stop
    /// delivery to the others; all errors are collected and the first is
    /// returned to the caller after every endpoint has been tried.
    pub async fn send(&self, outbound: Outbound) -> Result<()> {
        let key = outbound.group_kind.clone();
        let endpoints = {
            let routes = self.routes.read().await;
            routes.get(&key).cloned().unwrap_or_default()
        };

        if endpoints.is_empty() {
            return Err(RouterError::NoEndpoint(key));
        }

        let mut first_error = None;
        for endpoint in &endpoints {
            if let Err(e) = endpoint.send(&outbound).await {
                error!(endpoint = endpoint.name(), error = %e, "endpoint send failed");
                if first_error.is_none() {
                    first_error = Some(RouterError::EndpointFailed {
                        endpoint: endpoint.name().to_string(),
                        source: e,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_registered(&self, key: &GroupKind) -> bool {
        self.routes
            .read()
            .await
            .get(key)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEndpoint {
        name: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Endpoint for CountingEndpoint {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _outbound: &Outbound) -> std::result::Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_fans_out_to_all_registered_endpoints() {
        let router = EndpointRouter::new();
        let key = GroupKind::new("demo", "Foo");
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));

        router
            .register(
                key.clone(),
                Arc::new(CountingEndpoint {
                    name: "a".into(),
                    calls: calls_a.clone(),
                }),
            )
            .await;
        router
            .register(
                key.clone(),
                Arc::new(CountingEndpoint {
                    name: "b".into(),
                    calls: calls_b.clone(),
                }),
            )
            .await;

        router
            .send(Outbound::new(key, serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reregistering_same_name_does_not_duplicate_delivery() {
        let router = EndpointRouter::new();
        let key = GroupKind::new("demo", "Foo");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            router
                .register(
                    key.clone(),
                    Arc::new(CountingEndpoint {
                        name: "a".into(),
                        calls: calls.clone(),
                    }),
                )
                .await;
        }

        router
            .send(Outbound::new(key, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_with_no_endpoint_fails() {
        let router = EndpointRouter::new();
        let key = GroupKind::new("demo", "Unrouted");
        let err = router
            .send(Outbound::new(key, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NoEndpoint(_)));
    }

    #[tokio::test]
    async fn transport_endpoint_delegates_to_transport() {
        let transport = Arc::new(ChannelTransport::new());
        transport.declare_topic("demo").await.unwrap();
        transport
            .declare_queue("demo.q", &["demo".to_string()])
            .await
            .unwrap();

        let router = EndpointRouter::new();
        let key = GroupKind::new("demo", "Foo");
        router
            .register(
                key.clone(),
                Arc::new(TransportEndpoint::new("broker", transport.clone())),
            )
            .await;

        router
            .send(Outbound::new(key, serde_json::json!({"x": 1})))
            .await
            .unwrap();
    }
}
