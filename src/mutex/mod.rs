//! Distributed per-saga mutex.
//!
//! Guarantees single-writer semantics for a given saga UID across
//! orchestrator replicas. [`local::LocalMutex`] backs the `channel`
//! (standalone/test) deployment profile; [`redis::RedisMutex`] is the
//! networked backend, gated behind the `redis-mutex` feature.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod local;
#[cfg(feature = "redis-mutex")]
pub mod redis;

pub use local::LocalMutex;
#[cfg(feature = "redis-mutex")]
pub use redis::RedisMutex;

pub type Result<T> = std::result::Result<T, MutexError>;

#[derive(Debug, Error)]
pub enum MutexError {
    #[error("lock contended for '{0}'")]
    LockContended(String),

    #[error("lock lost for '{0}' (TTL expired)")]
    LockLost(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("cancelled while waiting for lock on '{0}'")]
    Cancelled(String),
}

/// A held lock. Dropping without calling [`DistributedMutex::release`]
/// still releases eventually — the lock carries a TTL — but callers
/// should release promptly so other replicas aren't left waiting out the
/// TTL window.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub saga_uid: String,
    pub holder: String,
    pub token: String,
}

/// Per-saga advisory lock.
///
/// Re-entrancy is undefined: a caller must not take the same lock twice
/// within one turn.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Blocks until the lock is held by this holder or `cancel` fires.
    /// Lock identity is bound to the holder + a random token so a foreign
    /// `release` (wrong token) is rejected rather than silently dropping
    /// someone else's lock.
    async fn lock(&self, saga_uid: &str, ttl: Duration, cancel: CancellationToken) -> Result<LockToken>;

    /// Releases the lock. Failure to release is the caller's to log; it
    /// must not propagate as a turn failure since the TTL bounds the
    /// blast radius of a stuck lock.
    async fn release(&self, token: &LockToken) -> Result<()>;
}
