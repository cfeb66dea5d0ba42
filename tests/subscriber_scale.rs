//! Boundary scenarios for the bounded worker pool: backpressure at the
//! configured pool size and graceful shutdown draining many in-flight
//! turns, driven through the real `Subscriber` + `ChannelTransport` pair
//! rather than the dispatcher in isolation.
//!
//! Run with: cargo test --test subscriber_scale

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use saga_engine::envelope::{Envelope, GroupKind, Headers, Outbound};
use saga_engine::subscriber::{MessageProcessor, ProcessError, Subscriber, SubscriberConfig, SubscriberState};
use saga_engine::transport::{ChannelTransport, SendOptions, Transport};

/// Holds every call open for `delay`, tracking concurrently in-flight
/// calls so the test can observe the pool never exceeding its capacity.
struct SlowProcessor {
    delay: Duration,
    in_flight: AtomicUsize,
    max_observed: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowProcessor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MessageProcessor for SlowProcessor {
    async fn process(&self, _envelope: &Envelope) -> Result<(), ProcessError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn push(transport: &ChannelTransport, topic: &str, n: usize) {
    for i in 0..n {
        let outbound = Outbound::new(GroupKind::new(topic, "Ping"), serde_json::json!({ "i": i }))
            .with_headers(Headers::new());
        transport.send(outbound, SendOptions::default()).await.unwrap();
    }
}

#[tokio::test]
async fn n_plus_one_messages_never_exceed_n_workers_in_flight() {
    const POOL_SIZE: usize = 100;
    const MESSAGE_COUNT: usize = POOL_SIZE + 1;

    let transport = Arc::new(ChannelTransport::new());
    transport.connect().await.unwrap();
    transport.declare_topic("scale").await.unwrap();
    transport
        .declare_queue("scale.q", &["scale".to_string()])
        .await
        .unwrap();

    push(&transport, "scale", MESSAGE_COUNT).await;

    let processor = Arc::new(SlowProcessor::new(Duration::from_millis(200)));
    let subscriber = Arc::new(Subscriber::new(
        transport.clone(),
        processor.clone(),
        SubscriberConfig {
            pool_size: POOL_SIZE,
            schedule_timeout: Duration::from_millis(50),
            package_processing_max_time: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(5),
        },
    ));

    let cancel = CancellationToken::new();
    let queues = vec!["scale.q".to_string()];
    let sub2 = Arc::clone(&subscriber);
    let cancel2 = cancel.clone();
    let handle = tokio::spawn(async move { sub2.run(&queues, cancel2).await });

    // All 100 workers should be saturated well before any of them finishes
    // their 200ms sleep; the 101st message has nowhere to go yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber.busy_workers(), POOL_SIZE);

    // Let the first wave finish and the 101st message get picked up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(processor.completed.load(Ordering::SeqCst), MESSAGE_COUNT);
    assert!(
        processor.max_observed.load(Ordering::SeqCst) <= POOL_SIZE,
        "backpressure must never let more than {POOL_SIZE} turns run concurrently"
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_drains_fifty_in_flight_turns_before_returning() {
    const IN_FLIGHT: usize = 50;

    let transport = Arc::new(ChannelTransport::new());
    transport.connect().await.unwrap();
    transport.declare_topic("drain").await.unwrap();
    transport
        .declare_queue("drain.q", &["drain".to_string()])
        .await
        .unwrap();

    push(&transport, "drain", IN_FLIGHT).await;

    let processor = Arc::new(SlowProcessor::new(Duration::from_millis(300)));
    let subscriber = Arc::new(Subscriber::new(
        transport.clone(),
        processor.clone(),
        SubscriberConfig {
            pool_size: IN_FLIGHT,
            schedule_timeout: Duration::from_millis(50),
            package_processing_max_time: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(5),
        },
    ));

    let cancel = CancellationToken::new();
    let queues = vec!["drain.q".to_string()];
    let sub2 = Arc::clone(&subscriber);
    let cancel2 = cancel.clone();
    let handle = tokio::spawn(async move { sub2.run(&queues, cancel2).await });

    // Give every message a chance to claim one of the 50 slots before
    // cancelling — this is the "50 in-flight" moment the shutdown must
    // drain rather than abandon.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber.busy_workers(), IN_FLIGHT);

    let started = tokio::time::Instant::now();
    cancel.cancel();
    handle.await.unwrap().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(subscriber.state().await, SubscriberState::Disconnected);
    assert_eq!(processor.completed.load(Ordering::SeqCst), IN_FLIGHT);
    assert!(
        elapsed < Duration::from_secs(5),
        "shutdown should return as soon as the in-flight turns drain, not wait for the full deadline"
    );
}

#[tokio::test]
async fn stop_with_zero_in_flight_returns_immediately() {
    let transport = Arc::new(ChannelTransport::new());
    transport.connect().await.unwrap();

    let processor = Arc::new(SlowProcessor::new(Duration::from_millis(50)));
    let subscriber = Subscriber::new(
        transport,
        processor,
        SubscriberConfig {
            pool_size: 4,
            schedule_timeout: Duration::from_millis(20),
            package_processing_max_time: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(30),
        },
    );

    let started = tokio::time::Instant::now();
    subscriber.stop(Duration::from_secs(30)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(subscriber.state().await, SubscriberState::Disconnected);
}
