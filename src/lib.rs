//! Saga Engine — a distributed saga orchestrator.
//!
//! Coordinates long-running, multi-step business transactions by treating
//! each transaction as a persistent, event-sourced state machine (a "saga
//! instance") that reacts to events and dispatches commands over an
//! asynchronous message bus.
//!
//! The crate is organized around three subsystems:
//! - [`saga`] + [`handler`]: the saga runtime — state machine, event-sourced
//!   history, and the per-turn orchestration that locks, loads, dispatches,
//!   and persists a single instance.
//! - [`subscriber`] + [`dispatch`]: the subscriber core — a bounded worker
//!   pool that pulls messages from a [`transport`], enforces concurrency
//!   limits, and drives orderly shutdown.
//! - [`store`] + [`mutex`]: persistent instance storage plus a distributed
//!   per-saga mutex guaranteeing single-writer semantics across replicas.
//!
//! [`registry`], [`envelope`], and [`router`] supply the typed message
//! plumbing those subsystems are built on. [`config`] and [`bootstrap`] wire
//! everything together for a running process.

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod handler;
pub mod mutex;
pub mod registry;
pub mod retry;
pub mod router;
pub mod saga;
pub mod store;
pub mod subscriber;
pub mod system_sagas;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bootstrap::{Engine, EngineBuilder};
pub use envelope::{Envelope, GroupKind, Headers, Outbound};
pub use registry::TypeRegistry;
pub use saga::{Saga, SagaContext, SagaInstance, SagaRegistry, SagaStatus};
