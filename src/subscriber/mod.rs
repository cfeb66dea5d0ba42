//! The Subscriber: drives the consume loop, binds incoming envelopes to
//! free workers, and owns orderly shutdown.
//!
//! State machine: `Idle -> Running -> Draining -> Disconnected`. All
//! transitions are one-way; a stopped subscriber cannot be restarted.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::envelope::Envelope;
use crate::transport::{ConsumeOptions, IncomingMessage, Transport, TransportError};

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("subscriber already started")]
    AlreadyStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Dispatches one already-decoded envelope to whatever handles it.
///
/// The saga engine's [`crate::handler::SagaEventsHandler`] is the
/// production implementation; tests can substitute a stub.
#[async_trait::async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError>;
}

/// Outcome of a failed [`MessageProcessor::process`] call, distinguishing
/// errors the broker should redeliver from ones redelivery can never fix.
#[derive(Debug)]
pub enum ProcessError {
    /// Leave the envelope unacked so the broker redelivers it (e.g. a
    /// transient store error, or a handler bug the next attempt might not
    /// hit).
    Retry(Box<dyn std::error::Error + Send + Sync>),
    /// Fatal for this turn, but redelivery would only reproduce the same
    /// outcome forever (e.g. the saga already completed) — ack it so the
    /// broker stops retrying.
    Fatal(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry(e) => write!(f, "{e}"),
            Self::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Running,
    Draining,
    Disconnected,
}

/// Tunables for the consume loop and shutdown.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberConfig {
    pub pool_size: usize,
    pub schedule_timeout: Duration,
    pub package_processing_max_time: Duration,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            pool_size: 100,
            schedule_timeout: Duration::from_secs(3),
            package_processing_max_time: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Subscriber {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    processor: Arc<dyn MessageProcessor>,
    config: SubscriberConfig,
    state: AsyncMutex<SubscriberState>,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<dyn MessageProcessor>,
        config: SubscriberConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::start(config.pool_size));
        Self {
            transport,
            dispatcher,
            processor,
            config,
            state: AsyncMutex::new(SubscriberState::Idle),
        }
    }

    pub async fn state(&self) -> SubscriberState {
        *self.state.lock().await
    }

    pub fn busy_workers(&self) -> usize {
        self.dispatcher.busy_workers()
    }

    /// Drives the consume loop for `queues` until `cancel` fires, then
    /// drains in-flight work and disconnects the transport.
    pub async fn run(&self, queues: &[String], cancel: CancellationToken) -> Result<(), SubscriberError> {
        {
            let mut state = self.state.lock().await;
            if *state != SubscriberState::Idle {
                return Err(SubscriberError::AlreadyStarted);
            }
            *state = SubscriberState::Running;
        }

        let opts = ConsumeOptions::with_prefetch(self.config.pool_size as u16);
        let mut incoming = self.transport.consume(queues, opts, cancel.clone()).await?;

        info!(queues = ?queues, pool_size = self.config.pool_size, "subscriber running");

        loop {
            let slot = match self.dispatcher.obtain_slot(&cancel).await {
                Some(slot) => slot,
                None => break,
            };

            match tokio::time::timeout(self.config.schedule_timeout, incoming.recv()).await {
                Ok(Some(message)) => {
                    let processor = Arc::clone(&self.processor);
                    let deadline = self.config.package_processing_max_time;
                    self.dispatcher.submit(slot, async move {
                        process_package(processor, message, deadline).await;
                    });
                }
                Ok(None) => {
                    drop(slot);
                    debug!("transport consume channel closed, stopping");
                    break;
                }
                Err(_elapsed) => {
                    drop(slot);
                    continue;
                }
            }
        }

        self.stop(self.config.graceful_shutdown_timeout).await
    }

    /// Convenience entry point: also cancels on SIGINT (and, on Unix,
    /// SIGTERM), entering `Draining` the same way an externally-cancelled
    /// `run` would.
    pub async fn run_until_signal(&self, queues: &[String]) -> Result<(), SubscriberError> {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                info!("received ctrl-c");
            }
            signal_cancel.cancel();
        });

        self.run(queues, cancel).await
    }

    /// Polls [`Dispatcher::busy_workers`] once a second until it reaches
    /// zero or `shutdown_timeout` elapses, then disconnects the transport.
    pub async fn stop(&self, shutdown_timeout: Duration) -> Result<(), SubscriberError> {
        {
            let mut state = self.state.lock().await;
            if *state == SubscriberState::Idle {
                *state = SubscriberState::Draining;
            } else if *state == SubscriberState::Running {
                *state = SubscriberState::Draining;
            }
        }

        let deadline = tokio::time::Instant::now() + shutdown_timeout;
        while self.dispatcher.busy_workers() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if self.dispatcher.busy_workers() > 0 {
            warn!(
                busy = self.dispatcher.busy_workers(),
                "graceful shutdown deadline reached with workers still in flight"
            );
        }

        self.transport.disconnect().await?;
        *self.state.lock().await = SubscriberState::Disconnected;
        Ok(())
    }
}

async fn process_package(
    processor: Arc<dyn MessageProcessor>,
    message: Box<dyn IncomingMessage>,
    deadline: Duration,
) {
    let uid = message.envelope().uid().to_string();
    match tokio::time::timeout(deadline, processor.process(message.envelope())).await {
        Ok(Ok(())) => {
            if let Err(e) = message.ack().await {
                error!(envelope_uid = %uid, error = %e, "failed to ack a successfully processed envelope");
            }
        }
        Ok(Err(ProcessError::Fatal(e))) => {
            warn!(envelope_uid = %uid, error = %e, "fatal for this turn and redelivery would not help, acking anyway");
            if let Err(ack_err) = message.ack().await {
                error!(envelope_uid = %uid, error = %ack_err, "failed to ack a fatally-failed envelope");
            }
        }
        Ok(Err(ProcessError::Retry(e))) => {
            error!(envelope_uid = %uid, error = %e, "processor failed, leaving envelope unacked for redelivery");
        }
        Err(_elapsed) => {
            warn!(envelope_uid = %uid, "package processing deadline exceeded, leaving envelope unacked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{GroupKind, Headers};
    use crate::transport::ChannelTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        calls: AtomicUsize,
        fail_until: usize,
    }

    #[async_trait::async_trait]
    impl MessageProcessor for CountingProcessor {
        async fn process(&self, _envelope: &Envelope) -> Result<(), ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_until {
                return Err(ProcessError::Retry("transient failure".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_processes_a_message_then_stops_on_cancel() {
        let transport = Arc::new(ChannelTransport::new());
        transport.connect().await.unwrap();
        transport.declare_topic("demo").await.unwrap();
        transport
            .declare_queue("demo.q", &["demo".to_string()])
            .await
            .unwrap();

        let processor = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
            fail_until: 0,
        });
        let subscriber = Arc::new(Subscriber::new(
            transport.clone(),
            processor.clone(),
            SubscriberConfig {
                pool_size: 2,
                schedule_timeout: Duration::from_millis(50),
                package_processing_max_time: Duration::from_secs(5),
                graceful_shutdown_timeout: Duration::from_secs(5),
            },
        ));

        let outbound = crate::envelope::Outbound::new(GroupKind::new("demo", "Ping"), serde_json::json!({}))
            .with_headers(Headers::new());
        transport
            .send(outbound, crate::transport::SendOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let queues = vec!["demo.q".to_string()];
        let sub2 = Arc::clone(&subscriber);
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { sub2.run(&queues, cancel2).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(subscriber.state().await, SubscriberState::Disconnected);
    }

    #[tokio::test]
    async fn already_started_subscriber_rejects_a_second_run() {
        let transport = Arc::new(ChannelTransport::new());
        transport.connect().await.unwrap();
        let processor = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
            fail_until: 0,
        });
        let subscriber = Arc::new(Subscriber::new(
            transport,
            processor,
            SubscriberConfig {
                pool_size: 1,
                schedule_timeout: Duration::from_millis(20),
                package_processing_max_time: Duration::from_secs(5),
                graceful_shutdown_timeout: Duration::from_millis(100),
            },
        ));

        let cancel = CancellationToken::new();
        let sub2 = Arc::clone(&subscriber);
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { sub2.run(&[], cancel2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = subscriber.run(&[], cancel.clone()).await.unwrap_err();
        assert!(matches!(err, SubscriberError::AlreadyStarted));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
